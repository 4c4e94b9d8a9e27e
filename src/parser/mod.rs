//! Workflow definition parsing.
//!
//! The parser is the bridge between user configuration and the token
//! namespace: it turns a workflow definition into the initial token set of
//! a new instance.  Jobs with upstream dependencies materialize under the
//! waiting branch; top-level jobs materialize runnable, with a
//! workflow-start event on their distinguished input so their completion
//! consumes an event like everyone else's.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use crate::grpc::proto::Token;
use crate::workflow::event::EventRecord;
use crate::workflow::job::JobRecord;
use crate::workflow::name::{TokenName, RUNNABLE_STATE, WAITING_STATE, WORKFLOW_START_INPUT};

fn default_max_attempts() -> u32 {
    1
}

/// One job in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub command: String,

    /// Names of upstream jobs this job depends on.
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub retry_delay_secs: i64,

    #[serde(default)]
    pub priority: f64,

    #[serde(default)]
    pub disabled: bool,
}

/// A workflow: a named, acyclic graph of jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow: String,
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("invalid workflow definition: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("workflow {0} has no jobs")]
    Empty(String),

    #[error("duplicate job {0}")]
    DuplicateJob(String),

    #[error("job {job} depends on unknown input {input}")]
    UnknownInput { job: String, input: String },

    #[error("dependency cycle involving job {0}")]
    Cycle(String),
}

impl WorkflowDefinition {
    /// Parse and validate a JSON definition.
    pub fn from_json(data: &[u8]) -> Result<Self, ParserError> {
        let definition: WorkflowDefinition = serde_json::from_slice(data)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Check that job names are unique, inputs reference defined jobs, and
    /// the graph is acyclic.
    pub fn validate(&self) -> Result<(), ParserError> {
        if self.jobs.is_empty() {
            return Err(ParserError::Empty(self.workflow.clone()));
        }
        let mut names = std::collections::HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(ParserError::DuplicateJob(job.name.clone()));
            }
        }
        for job in &self.jobs {
            for input in &job.inputs {
                if !names.contains(input.as_str()) {
                    return Err(ParserError::UnknownInput {
                        job: job.name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle.
        let mut in_degree: HashMap<&str, usize> = self
            .jobs
            .iter()
            .map(|job| (job.name.as_str(), job.inputs.len()))
            .collect();
        let downstream = self.downstream_edges();
        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut visited = 0;
        while let Some(name) = ready.pop_front() {
            visited += 1;
            if let Some(successors) = downstream.get(name) {
                for successor in successors {
                    let degree = in_degree.get_mut(successor.as_str()).expect("known job");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(successor.as_str());
                    }
                }
            }
        }
        if visited != self.jobs.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, degree)| **degree > 0)
                .map(|(name, _)| name.to_string())
                .unwrap_or_default();
            return Err(ParserError::Cycle(stuck));
        }
        Ok(())
    }

    fn downstream_edges(&self) -> HashMap<&str, Vec<String>> {
        let mut downstream: HashMap<&str, Vec<String>> = HashMap::new();
        for job in &self.jobs {
            for input in &job.inputs {
                downstream
                    .entry(input.as_str())
                    .or_default()
                    .push(job.name.clone());
            }
        }
        downstream
    }

    /// A fresh instance id.  Millisecond timestamps keep instance ids of
    /// one workflow in creation order.
    pub fn new_instance_id() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
            .to_string()
    }

    /// Emit the initial token set of a new instance.
    ///
    /// All returned tokens are inserts (no versions); the caller posts
    /// them in one atomic `modify`.
    pub fn instance_tokens(&self, instance: &str) -> Result<Vec<Token>, ParserError> {
        self.validate()?;
        let downstream = self.downstream_edges();
        let mut tokens = Vec::new();
        for definition in &self.jobs {
            let top_level = definition.inputs.is_empty();
            let inputs = if top_level {
                vec![WORKFLOW_START_INPUT.to_string()]
            } else {
                definition.inputs.clone()
            };
            let record = JobRecord {
                name: definition.name.clone(),
                command: definition.command.clone(),
                inputs,
                outputs: downstream
                    .get(definition.name.as_str())
                    .cloned()
                    .unwrap_or_default(),
                max_attempts: definition.max_attempts,
                retry_delay_secs: definition.retry_delay_secs,
                disabled: definition.disabled,
                history: Vec::new(),
            };
            let state = if top_level { RUNNABLE_STATE } else { WAITING_STATE };
            let name = TokenName::new()
                .with_workflow(&self.workflow)
                .with_instance(instance)
                .with_job(&definition.name);
            tokens.push(Token {
                name: name
                    .clone()
                    .with_job_state(state)
                    .job_token_name()
                    .expect("name components are set"),
                priority: definition.priority,
                data: record.encode(),
                ..Default::default()
            });
            if top_level {
                let event = EventRecord::new("parser");
                tokens.push(Token {
                    name: name
                        .with_input(WORKFLOW_START_INPUT)
                        .with_event(&Uuid::new_v4().to_string())
                        .event_token_name()
                        .expect("name components are set"),
                    data: event.encode(),
                    ..Default::default()
                });
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition {
            workflow: "etl".to_string(),
            jobs: vec![
                JobDefinition {
                    name: "extract".to_string(),
                    command: "true".to_string(),
                    inputs: vec![],
                    max_attempts: 1,
                    retry_delay_secs: 0,
                    priority: 0.0,
                    disabled: false,
                },
                JobDefinition {
                    name: "load".to_string(),
                    command: "true".to_string(),
                    inputs: vec!["extract".to_string()],
                    max_attempts: 1,
                    retry_delay_secs: 0,
                    priority: 0.0,
                    disabled: false,
                },
            ],
        }
    }

    #[test]
    fn test_instance_tokens_shape() {
        let tokens = chain().instance_tokens("123").unwrap();
        let names: Vec<&str> = tokens.iter().map(|t| t.name.as_str()).collect();

        assert!(names.contains(&"/workflow/etl/123/job/runnable/extract"));
        assert!(names.contains(&"/workflow/etl/123/job/waiting/load"));
        assert!(names
            .iter()
            .any(|n| n.starts_with("/workflow/etl/123/input/extract/__WORKFLOW_START__/")));
        assert_eq!(tokens.len(), 3);

        let extract = tokens
            .iter()
            .find(|t| t.name.ends_with("runnable/extract"))
            .unwrap();
        let record = JobRecord::decode(&extract.data).unwrap();
        assert_eq!(record.inputs, vec![WORKFLOW_START_INPUT.to_string()]);
        assert_eq!(record.outputs, vec!["load".to_string()]);
    }

    #[test]
    fn test_unknown_input_rejected() {
        let mut definition = chain();
        definition.jobs[1].inputs = vec!["missing".to_string()];
        assert!(matches!(
            definition.validate(),
            Err(ParserError::UnknownInput { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut definition = chain();
        definition.jobs[0].inputs = vec!["load".to_string()];
        assert!(matches!(definition.validate(), Err(ParserError::Cycle(_))));
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let mut definition = chain();
        definition.jobs[1].name = "extract".to_string();
        assert!(matches!(
            definition.validate(),
            Err(ParserError::DuplicateJob(_))
        ));
    }

    #[test]
    fn test_from_json() {
        let json = br#"{
            "workflow": "etl",
            "jobs": [
                {"name": "extract", "command": "echo extract"},
                {"name": "load", "command": "echo load", "inputs": ["extract"]}
            ]
        }"#;
        let definition = WorkflowDefinition::from_json(json).unwrap();
        assert_eq!(definition.workflow, "etl");
        assert_eq!(definition.jobs[1].inputs, vec!["extract".to_string()]);
    }
}
