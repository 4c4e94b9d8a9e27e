//! Signals steer workflow workers.
//!
//! Signal records stored in tokens are how operators and workers talk to
//! each other.  Workers poll for signal tokens and act on them; the master
//! knows nothing about their meaning.
//!
//! A signal's scope is where its token lives: a DRAIN posted to
//! `/workflow/__SIGNAL__/` drains every workflow in the system, one under
//! `/workflow/<w>/__SIGNAL__/` drains instances of `<w>` only, and one
//! under `/workflow/<w>/<i>/__SIGNAL__/` drains a single instance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::grpc::proto::{Token, TokenQuery};
use crate::grpc::MasterClient;
use crate::master::MasterError;
use crate::workflow::name::TokenName;
use crate::workflow::Result;

/// Actions a signal can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalAction {
    /// Finish currently running jobs but do not start new ones.
    Drain,
    /// Abort running jobs, do not start new ones.
    Abort,
    /// Archive the workflow instance once nothing is runnable.
    Archive,
    /// Shut down workers of older generations.
    Exit,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Drain => "DRAIN",
            SignalAction::Abort => "ABORT",
            SignalAction::Archive => "ARCHIVE",
            SignalAction::Exit => "EXIT",
        }
    }
}

/// Payload of a signal token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub action: SignalAction,

    /// Worker-cohort tag carried by EXIT; workers of an older generation
    /// observe it and shut down.
    #[serde(default)]
    pub generation: Option<u64>,

    /// Deadline attribute; ARCHIVE uses it for the archive delay.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl SignalRecord {
    pub fn new(action: SignalAction) -> Self {
        Self {
            action,
            generation: None,
            timestamp: None,
        }
    }

    pub fn decode(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("signal record serialization cannot fail")
    }
}

/// Delivers and retrieves signals at one scope.
///
/// Loads every signal visible at its scope (the scope itself plus all
/// enclosing ones) so a worker asking about an instance also sees
/// workflow-wide and system-wide signals.
pub struct Signaller {
    client: MasterClient,
    workflow: Option<String>,
    instance: Option<String>,
    signals: HashMap<SignalAction, (Token, SignalRecord)>,
}

impl Signaller {
    pub async fn load(
        client: MasterClient,
        workflow: Option<&str>,
        instance: Option<&str>,
    ) -> Result<Self> {
        let mut signaller = Self {
            client,
            workflow: workflow.map(str::to_string),
            instance: instance.map(str::to_string),
            signals: HashMap::new(),
        };
        signaller.refresh().await?;
        Ok(signaller)
    }

    fn scope_name(&self) -> TokenName {
        let mut name = TokenName::new();
        name.workflow = self.workflow.clone();
        name.instance = self.instance.clone();
        name
    }

    /// Reload signals from the master.
    pub async fn refresh(&mut self) -> Result<()> {
        let mut queries = vec![TokenQuery {
            name_prefix: TokenName::new().signal_prefix(),
            max_tokens: 0,
        }];
        if let Some(workflow) = &self.workflow {
            let name = TokenName::new().with_workflow(workflow);
            queries.push(TokenQuery {
                name_prefix: name.signal_prefix(),
                max_tokens: 0,
            });
            if let Some(instance) = &self.instance {
                let name = TokenName::new()
                    .with_workflow(workflow)
                    .with_instance(instance);
                queries.push(TokenQuery {
                    name_prefix: name.signal_prefix(),
                    max_tokens: 0,
                });
            }
        }

        let results = self.client.query(queries).await?;
        self.signals.clear();
        // The same action may be signalled at several scopes; keeping an
        // arbitrary one is fine because workers only check presence.
        for token in results.into_iter().flatten() {
            let record = SignalRecord::decode(&token.data)?;
            self.signals.insert(record.action, (token, record));
        }
        Ok(())
    }

    /// True iff a signal for the action is visible at this scope.
    pub fn is_set(&self, action: SignalAction) -> bool {
        self.signals.contains_key(&action)
    }

    /// True iff an EXIT signal applies to a worker of `generation`.
    ///
    /// An EXIT carrying a generation stops only workers of strictly older
    /// generations, which is what makes rolling upgrades possible: new
    /// workers come up tagged above the signal and keep running.
    pub fn exit_requested(&self, generation: u64) -> bool {
        match self.signals.get(&SignalAction::Exit) {
            Some((_, record)) => record.generation.map_or(true, |g| g > generation),
            None => false,
        }
    }

    pub fn timestamp(&self, action: SignalAction) -> Option<i64> {
        self.signals
            .get(&action)
            .and_then(|(_, record)| record.timestamp)
    }

    async fn fetch_signal_token(&mut self, action: SignalAction) -> Result<Option<Token>> {
        let name = self
            .scope_name()
            .with_signal(action.as_str())
            .signal_token_name()
            .expect("signal name is always complete");
        let tokens = self.client.query_prefix(&name, 1).await?;
        Ok(tokens.into_iter().find(|t| t.name == name))
    }

    /// Post a signal at this scope.  Returns false when an equivalent
    /// signal was already in place or another actor won the race.
    pub async fn set(&mut self, record: SignalRecord) -> Result<bool> {
        if let Some((_, existing)) = self.signals.get(&record.action) {
            if *existing == record {
                return Ok(false);
            }
        }
        // A signal with the same action but different payload may already
        // exist in the master.
        let mut token = match self.fetch_signal_token(record.action).await? {
            Some(token) => token,
            None => Token {
                name: self
                    .scope_name()
                    .with_signal(record.action.as_str())
                    .signal_token_name()
                    .expect("signal name is always complete"),
                ..Default::default()
            },
        };
        token.data = record.encode();
        match self.client.modify(vec![token], vec![]).await {
            Ok(mut written) => {
                let token = written.pop().ok_or_else(|| {
                    MasterError::Unknown("modify returned no tokens".to_string())
                })?;
                self.signals.insert(record.action, (token, record));
                Ok(true)
            }
            Err(MasterError::VersionConflict(_)) => {
                // Someone posted the signal concurrently.
                self.refresh().await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a signal with a given action from this scope.
    pub async fn remove(&mut self, action: SignalAction) -> Result<()> {
        if let Some(token) = self.fetch_signal_token(action).await? {
            self.client.modify(vec![], vec![token]).await?;
        }
        self.signals.remove(&action);
        Ok(())
    }

    /// Set the timestamp attribute unless it is already set.  Returns true
    /// iff this caller set it.
    pub async fn set_timestamp_if_missing(
        &mut self,
        action: SignalAction,
        timestamp: i64,
    ) -> Result<bool> {
        if self.timestamp(action).is_some() {
            return Ok(false);
        }
        let Some(mut token) = self.fetch_signal_token(action).await? else {
            return Ok(false);
        };
        let mut record = SignalRecord::decode(&token.data)?;
        if record.timestamp.is_some() {
            self.signals.insert(action, (token, record));
            return Ok(false);
        }
        record.timestamp = Some(timestamp);
        token.data = record.encode();
        match self.client.modify(vec![token], vec![]).await {
            Ok(mut written) => {
                let token = written.pop().ok_or_else(|| {
                    MasterError::Unknown("modify returned no tokens".to_string())
                })?;
                self.signals.insert(action, (token, record));
                Ok(true)
            }
            Err(MasterError::VersionConflict(_)) => {
                self.refresh().await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let mut record = SignalRecord::new(SignalAction::Exit);
        record.generation = Some(3);
        let decoded = SignalRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_action_names() {
        assert_eq!(SignalAction::Drain.as_str(), "DRAIN");
        assert_eq!(SignalAction::Abort.as_str(), "ABORT");
        assert_eq!(SignalAction::Archive.as_str(), "ARCHIVE");
        assert_eq!(SignalAction::Exit.as_str(), "EXIT");
    }
}
