//! Job execution contract.
//!
//! The runtime core does not care how a job actually runs; it hands the
//! executor a command plus the consolidated attributes of the triggering
//! events and expects an exit code and exported properties back.  The
//! shell executor below is the default implementation; log shipping and
//! alerting live behind this seam, outside the runtime.

use std::collections::HashMap;

use slog::{debug, warn, Logger};
use thiserror::Error;
use tokio::sync::watch;

/// What an executor gets to work with.
pub struct ExecutionContext {
    pub workflow: String,
    pub instance: String,
    pub job: String,
    pub command: String,

    /// Attributes consolidated from the triggering events, exposed to the
    /// command as environment variables.
    pub attributes: HashMap<String, String>,

    /// Flips to true when the execution must stop (instance abort or lost
    /// lease).
    pub abort: watch::Receiver<bool>,
}

/// What an execution produced.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub exit_code: i32,

    /// Attributes posted on this job's output events.
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to launch job: {0}")]
    Launch(String),

    #[error("job aborted")]
    Aborted,
}

#[tonic::async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Runs job commands through `sh -c`.
pub struct ShellExecutor {
    log: Logger,
}

impl ShellExecutor {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

#[tonic::async_trait]
impl JobExecutor for ShellExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionOutcome, ExecutorError> {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(&ctx.command);
        for (key, value) in &ctx.attributes {
            command.env(key, value);
        }

        debug!(self.log, "launching job command";
            "workflow" => &ctx.workflow,
            "instance" => &ctx.instance,
            "job" => &ctx.job
        );
        let mut child = command
            .spawn()
            .map_err(|e| ExecutorError::Launch(e.to_string()))?;

        let mut abort = ctx.abort.clone();
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| ExecutorError::Launch(e.to_string()))?;
                Ok(ExecutionOutcome {
                    exit_code: status.code().unwrap_or(-1),
                    properties: HashMap::new(),
                })
            }
            // A closed abort channel means the renewal task is gone; treat
            // it the same as an abort.
            _ = abort.wait_for(|aborted| *aborted) => {
                warn!(self.log, "aborting job command";
                    "workflow" => &ctx.workflow,
                    "job" => &ctx.job
                );
                let _ = child.kill().await;
                Err(ExecutorError::Aborted)
            }
        }
    }
}
