//! Archival of finished workflow instances.
//!
//! Archiving moves every token under an instance prefix into the archive
//! namespace in one `archive` call, so the instance disappears from the
//! live namespace at a single point in time.

use crate::grpc::proto::Token;
use crate::grpc::MasterClient;
use crate::master::{now_secs, MasterError};
use crate::workflow::name::TokenName;
use crate::workflow::signal::SignalAction;
use crate::workflow::Result;

// Clocks on different machines can be off by this much; ownership checks
// err on the side of calling a token owned.
const CLOCK_SKEW_THRESHOLD_SECS: i64 = 10;

pub struct Archiver {
    client: MasterClient,
    workflow: String,
    instance: String,
}

impl Archiver {
    pub fn new(client: MasterClient, workflow: &str, instance: &str) -> Self {
        Self {
            client,
            workflow: workflow.to_string(),
            instance: instance.to_string(),
        }
    }

    async fn instance_tokens(&mut self) -> Result<Vec<Token>> {
        let prefix = TokenName::new()
            .with_workflow(&self.workflow)
            .with_instance(&self.instance)
            .instance_prefix()
            .expect("workflow and instance are set");
        Ok(self.client.query_prefix(&prefix, 0).await?)
    }

    async fn archive_tokens(&mut self, tokens: Vec<Token>) -> Result<bool> {
        match self.client.archive(tokens).await {
            Ok(()) => Ok(true),
            // A concurrent change is no big deal; the same or a different
            // worker will try again some other time.
            Err(MasterError::VersionConflict(_)) | Err(MasterError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Archive the instance once the archive deadline has passed.
    pub async fn archive_if_expired(&mut self, expiration_timestamp: i64) -> Result<bool> {
        if expiration_timestamp > now_secs() {
            return Ok(false);
        }
        let tokens = self.instance_tokens().await?;
        if tokens.is_empty() {
            return Ok(false);
        }
        self.archive_tokens(tokens).await
    }

    fn has_abort_token(&self, tokens: &[Token]) -> bool {
        let abort_name = TokenName::new()
            .with_workflow(&self.workflow)
            .with_instance(&self.instance)
            .with_signal(SignalAction::Abort.as_str())
            .signal_token_name()
            .expect("signal name is complete");
        tokens.iter().any(|t| t.name == abort_name)
    }

    /// Conservative ownership check: true unless the lease expired more
    /// than the clock-skew margin ago.
    fn is_owned(token: &Token) -> bool {
        if token.expiration_time == 0 {
            return false;
        }
        now_secs() - token.expiration_time < CLOCK_SKEW_THRESHOLD_SECS
    }

    /// Archive an aborted instance once no token is owned anymore.
    pub async fn archive_if_aborted(&mut self) -> Result<bool> {
        let tokens = self.instance_tokens().await?;
        if tokens.is_empty()
            || !self.has_abort_token(&tokens)
            || tokens.iter().any(Self::is_owned)
        {
            return Ok(false);
        }
        self.archive_tokens(tokens).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_owned_respects_clock_skew() {
        let mut token = Token {
            name: "/workflow/w/i/job/runnable/j".to_string(),
            owner: "w1".to_string(),
            ..Default::default()
        };
        token.expiration_time = now_secs() + 60;
        assert!(Archiver::is_owned(&token));

        // Expired a moment ago: still treated as owned because of skew.
        token.expiration_time = now_secs() - 2;
        assert!(Archiver::is_owned(&token));

        token.expiration_time = now_secs() - CLOCK_SKEW_THRESHOLD_SECS - 1;
        assert!(!Archiver::is_owned(&token));

        token.expiration_time = 0;
        assert!(!Archiver::is_owned(&token));
    }
}
