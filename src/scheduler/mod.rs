//! Time-driven workflow instantiation.
//!
//! Schedules are ordinary tokens under `/schedule/workflow/`, claimable
//! like any other.  The trick that drives the whole protocol: a schedule
//! token's lease always ends at its next run time, so the schedules that
//! are due are exactly the claimable ones and `query_and_own` doubles as
//! the timer.  Several scheduler processes can run side by side; whoever
//! claims a schedule runs it, everyone else simply finds nothing due.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::grpc::proto::Token;
use crate::grpc::MasterClient;
use crate::master::{now_secs, MasterError};
use crate::parser::WorkflowDefinition;
use crate::workflow::job::JobRecord;
use crate::workflow::name::{TokenName, SCHEDULE_PREFIX, WAITING_STATE};
use crate::workflow::signal::{SignalAction, SignalRecord, Signaller};
use crate::workflow::Result;

/// What to do when a schedule fires while a previous run is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrunPolicy {
    /// Start a new instance in parallel to currently running ones.
    StartNew,
    /// Skip this run entirely.
    Skip,
    /// Abort the running instances before starting a new one.
    AbortRunning,
    /// Delay the run until the previous one finishes.
    Delay,
    /// Delay the run until the previous one finishes successfully.
    DelayUntilSuccess,
}

/// Payload of a schedule token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub workflow: String,
    pub next_run_time: i64,
    pub recurrence_secs: i64,
    pub overrun_policy: OverrunPolicy,

    /// Cap on concurrently running instances; unlimited when absent.
    #[serde(default)]
    pub max_running_instances: Option<u32>,
}

impl ScheduleRecord {
    pub fn decode(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("schedule record serialization cannot fail")
    }

    /// Advance the run time to the first recurrence strictly after now.
    pub fn advance_next_run_time(&mut self, now: i64) {
        if self.next_run_time <= now {
            let delta_runs = (now - self.next_run_time) / self.recurrence_secs + 1;
            self.next_run_time += delta_runs * self.recurrence_secs;
            if self.next_run_time == now {
                self.next_run_time += self.recurrence_secs;
            }
        }
    }
}

/// Claims due schedule tokens and boots workflow instances.
pub struct Scheduler {
    client: MasterClient,
    definitions: HashMap<String, WorkflowDefinition>,
    config: SchedulerConfig,
    name: String,
    log: Logger,
}

impl Scheduler {
    pub fn new(client: MasterClient, config: SchedulerConfig, log: Logger) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let name = format!("scheduler-{}-{}-{}", host, std::process::id(), Uuid::new_v4());
        Self {
            client,
            definitions: HashMap::new(),
            config,
            name,
            log,
        }
    }

    /// Make a workflow definition available for instantiation.
    pub fn register(&mut self, definition: WorkflowDefinition) {
        self.definitions
            .insert(definition.workflow.clone(), definition);
    }

    /// Post a schedule token for a workflow, leased until its first run
    /// time.  An existing schedule is left untouched.
    pub async fn post_schedule(&mut self, record: &ScheduleRecord) -> Result<()> {
        let token = Token {
            name: TokenName::new()
                .with_workflow(&record.workflow)
                .workflow_schedule_token_name()
                .expect("workflow is set"),
            owner: self.name.clone(),
            expiration_time: record.next_run_time,
            data: record.encode(),
            ..Default::default()
        };
        match self.client.modify(vec![token], vec![]).await {
            Ok(_) => Ok(()),
            Err(MasterError::VersionConflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn jittered_poll(&self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64((1.0 + jitter) * self.config.poll_secs as f64)
    }

    /// Run the scheduler loop.
    pub async fn run(&mut self) {
        info!(self.log, "running scheduler"; "name" => &self.name);
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.jittered_poll()).await,
                Err(e) => {
                    warn!(self.log, "scheduler loop error"; "error" => %e);
                    tokio::time::sleep(self.jittered_poll()).await;
                }
            }
        }
    }

    /// Claim one due schedule and act on it.  Returns false when nothing
    /// was due.
    pub async fn run_once(&mut self) -> Result<bool> {
        let expiration = now_secs() + self.config.lease_secs;
        let mut claimed = self
            .client
            .query_and_own(&self.name, expiration, SCHEDULE_PREFIX, 1)
            .await?;
        let Some(token) = claimed.pop() else {
            return Ok(false);
        };
        self.run_or_reschedule(token).await?;
        Ok(true)
    }

    async fn run_or_reschedule(&mut self, mut token: Token) -> Result<()> {
        let mut schedule = ScheduleRecord::decode(&token.data)?;
        let now = now_secs();
        let mut instance_tokens = Vec::new();

        if schedule.next_run_time > now {
            // Clock skew let us claim a schedule slightly early; push the
            // lease back to the real run time.
            token.expiration_time = schedule.next_run_time;
        } else {
            let running = self.running_instances(&schedule.workflow).await?;
            let is_running = !running.is_empty();
            let run_now = match schedule.overrun_policy {
                OverrunPolicy::StartNew | OverrunPolicy::AbortRunning => true,
                OverrunPolicy::Skip | OverrunPolicy::Delay => !is_running,
                OverrunPolicy::DelayUntilSuccess => {
                    !is_running && !self.latest_instance_failed(&schedule.workflow).await?
                }
            };
            if run_now {
                if schedule.overrun_policy == OverrunPolicy::AbortRunning {
                    self.abort_instances(&schedule.workflow, &running).await?;
                }
                match self.emit_instance(&schedule).await? {
                    Some(tokens) => {
                        instance_tokens = tokens;
                        schedule.advance_next_run_time(now);
                        token.expiration_time = schedule.next_run_time;
                        token.data = schedule.encode();
                    }
                    // Instance cap hit; keep the lease and try again when
                    // it expires.
                    None => {}
                }
            } else if schedule.overrun_policy == OverrunPolicy::Skip {
                schedule.advance_next_run_time(now);
                token.expiration_time = schedule.next_run_time;
                token.data = schedule.encode();
            } else {
                token.expiration_time = now + self.config.delay_secs;
            }
        }

        let mut updates = instance_tokens;
        updates.push(token);
        match self.client.modify(updates, vec![]).await {
            Ok(_) => Ok(()),
            Err(MasterError::VersionConflict(_)) => {
                // Another actor touched the schedule; it will be retried
                // whenever it becomes claimable again.
                warn!(self.log, "schedule update conflicted"; "workflow" => &schedule.workflow);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn emit_instance(&mut self, schedule: &ScheduleRecord) -> Result<Option<Vec<Token>>> {
        if !self.definitions.contains_key(&schedule.workflow) {
            warn!(self.log, "no definition registered for workflow";
                "workflow" => &schedule.workflow);
            return Ok(None);
        }
        if let Some(cap) = schedule.max_running_instances {
            let running = self.running_instances(&schedule.workflow).await?;
            if running.len() as u32 >= cap {
                warn!(self.log, "too many instances running";
                    "workflow" => &schedule.workflow,
                    "running" => running.len()
                );
                return Ok(None);
            }
        }
        let definition = self.definitions[&schedule.workflow].clone();
        let instance = WorkflowDefinition::new_instance_id();
        let tokens = definition.instance_tokens(&instance)?;
        info!(self.log, "starting workflow instance";
            "workflow" => &definition.workflow,
            "instance" => &instance,
            "tokens" => tokens.len()
        );
        Ok(Some(tokens))
    }

    /// Live instances that have not reached a terminal signal yet.
    async fn running_instances(&mut self, workflow: &str) -> Result<Vec<String>> {
        let mut inspector = crate::workflow::Inspector::new(self.client.clone());
        let mut running = Vec::new();
        for instance in inspector.instance_ids(workflow).await? {
            let signals =
                Signaller::load(self.client.clone(), Some(workflow), Some(&instance)).await?;
            if !signals.is_set(SignalAction::Archive) && !signals.is_set(SignalAction::Abort) {
                running.push(instance);
            }
        }
        Ok(running)
    }

    /// True iff the most recent live instance recorded a failed job.
    /// Archived history is not consulted; failed instances linger through
    /// their archive delay long enough to be observed here.
    async fn latest_instance_failed(&mut self, workflow: &str) -> Result<bool> {
        let mut inspector = crate::workflow::Inspector::new(self.client.clone());
        let mut instances = inspector.instance_ids(workflow).await?;
        instances.sort();
        let Some(latest) = instances.pop() else {
            return Ok(false);
        };
        let prefix = TokenName::new()
            .with_workflow(workflow)
            .with_instance(&latest)
            .with_job_state(WAITING_STATE)
            .job_state_prefix()
            .expect("name components are set");
        for token in self.client.query_prefix(&prefix, 0).await? {
            let job = JobRecord::decode(&token.data)?;
            if let Some(record) = job.history.last() {
                if record.instance == latest && !record.succeeded() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn abort_instances(&mut self, workflow: &str, instances: &[String]) -> Result<()> {
        for instance in instances {
            let mut signals =
                Signaller::load(self.client.clone(), Some(workflow), Some(instance)).await?;
            let mut record = SignalRecord::new(SignalAction::Abort);
            record.timestamp = Some(now_secs());
            signals.set(record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_skips_missed_runs() {
        let mut schedule = ScheduleRecord {
            workflow: "etl".to_string(),
            next_run_time: 100,
            recurrence_secs: 60,
            overrun_policy: OverrunPolicy::Skip,
            max_running_instances: None,
        };
        // Three runs were missed; the next one lands strictly after now.
        schedule.advance_next_run_time(250);
        assert_eq!(schedule.next_run_time, 280);
    }

    #[test]
    fn test_advance_lands_after_exact_boundary() {
        let mut schedule = ScheduleRecord {
            workflow: "etl".to_string(),
            next_run_time: 100,
            recurrence_secs: 60,
            overrun_policy: OverrunPolicy::Skip,
            max_running_instances: None,
        };
        schedule.advance_next_run_time(100);
        assert_eq!(schedule.next_run_time, 160);
    }

    #[test]
    fn test_future_schedule_untouched() {
        let mut schedule = ScheduleRecord {
            workflow: "etl".to_string(),
            next_run_time: 500,
            recurrence_secs: 60,
            overrun_policy: OverrunPolicy::Skip,
            max_running_instances: None,
        };
        schedule.advance_next_run_time(100);
        assert_eq!(schedule.next_run_time, 500);
    }

    #[test]
    fn test_record_round_trip() {
        let schedule = ScheduleRecord {
            workflow: "etl".to_string(),
            next_run_time: 100,
            recurrence_secs: 3600,
            overrun_policy: OverrunPolicy::DelayUntilSuccess,
            max_running_instances: Some(2),
        };
        assert_eq!(ScheduleRecord::decode(&schedule.encode()).unwrap(), schedule);
    }
}
