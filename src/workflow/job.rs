//! Job metadata carried in job token data.
//!
//! A job record describes the job's place in the graph (inputs and
//! outputs), how to execute it, and its execution history.  History is
//! first-class: each record keeps the triggering events it consumed, so
//! re-running a past execution is just re-posting those events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::workflow::event::EventRecord;

fn default_max_attempts() -> u32 {
    1
}

/// Payload of a job token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,

    /// Command line executed by the job executor.
    pub command: String,

    /// Names of upstream inputs (upstream job names, or the workflow-start
    /// input for top-level jobs).
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Names of downstream jobs armed by this job's completion.
    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lease left on a failed token before it becomes claimable again.
    #[serde(default)]
    pub retry_delay_secs: i64,

    /// A disabled job is marked successful without executing.
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub history: Vec<ExecutionRecord>,
}

/// One execution of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub instance: String,
    pub worker: String,
    pub start_time: i64,

    #[serde(default)]
    pub end_time: Option<i64>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Triggering events consumed by this execution.
    #[serde(default)]
    pub events: Vec<EventRecord>,

    /// Attributes exported by the execution, posted on output events.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ExecutionRecord {
    pub fn started(instance: &str, worker: &str, start_time: i64) -> Self {
        Self {
            instance: instance.to_string(),
            worker: worker.to_string(),
            start_time,
            end_time: None,
            exit_code: None,
            events: Vec::new(),
            properties: HashMap::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl JobRecord {
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("job record serialization cannot fail")
    }

    pub fn last_record(&self) -> Option<&ExecutionRecord> {
        self.history.last()
    }

    pub fn last_record_mut(&mut self) -> Option<&mut ExecutionRecord> {
        self.history.last_mut()
    }

    /// Decide whether a failed job should be retried within `instance`.
    ///
    /// Counts failed runs of the current instance from the tail of the
    /// history; successful runs may appear in between when an execution is
    /// being redone.
    pub fn retry(&self, instance: &str) -> bool {
        let Some(last) = self.history.last() else {
            return false;
        };
        if last.instance != instance || last.succeeded() {
            return false;
        }
        let mut failed_runs = 0u32;
        for record in self.history.iter().rev() {
            if record.instance != instance {
                break;
            }
            if !record.succeeded() {
                failed_runs += 1;
            }
            if failed_runs >= self.max_attempts {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(max_attempts: u32) -> JobRecord {
        JobRecord {
            name: "extract".to_string(),
            command: "true".to_string(),
            inputs: vec![],
            outputs: vec![],
            max_attempts,
            retry_delay_secs: 0,
            disabled: false,
            history: vec![],
        }
    }

    fn record(instance: &str, exit_code: i32) -> ExecutionRecord {
        let mut record = ExecutionRecord::started(instance, "w", 0);
        record.end_time = Some(1);
        record.exit_code = Some(exit_code);
        record
    }

    #[test]
    fn test_encode_decode() {
        let mut job = job(3);
        job.history.push(record("i1", 0));
        let decoded = JobRecord::decode(&job.encode()).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_no_retry_without_history() {
        assert!(!job(3).retry("i1"));
    }

    #[test]
    fn test_retry_until_attempts_exhausted() {
        let mut job = job(2);
        job.history.push(record("i1", 1));
        assert!(job.retry("i1"));
        job.history.push(record("i1", 1));
        assert!(!job.retry("i1"));
    }

    #[test]
    fn test_failures_from_other_instances_ignored() {
        let mut job = job(2);
        job.history.push(record("i0", 1));
        job.history.push(record("i0", 1));
        job.history.push(record("i1", 1));
        assert!(job.retry("i1"));
    }

    #[test]
    fn test_no_retry_after_success() {
        let mut job = job(2);
        job.history.push(record("i1", 0));
        assert!(!job.retry("i1"));
    }
}
