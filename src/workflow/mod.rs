//! Workflow runtime built on top of the token master.
//!
//! A workflow is a directed graph of jobs represented entirely by tokens in
//! the master's name hierarchy: job tokens encode their lifecycle state in
//! their location (`waiting` vs `runnable`), event tokens represent
//! satisfied inputs, and signal tokens steer workers.  Workers coordinate
//! exclusively through atomic master operations and optimistic version
//! checks; there is no worker-to-worker channel of any kind.

pub mod archiver;
pub mod event;
pub mod executor;
pub mod inspector;
pub mod job;
pub mod name;
pub mod signal;
pub mod worker;

pub use archiver::Archiver;
pub use event::EventRecord;
pub use executor::{ExecutionContext, ExecutionOutcome, ExecutorError, JobExecutor, ShellExecutor};
pub use inspector::Inspector;
pub use job::{ExecutionRecord, JobRecord};
pub use name::TokenName;
pub use signal::{SignalAction, SignalRecord, Signaller};
pub use worker::Worker;

use thiserror::Error;

use crate::master::MasterError;

/// Errors raised by workflow-side actors (workers, archivers, schedulers).
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("master error: {0}")]
    Master(#[from] MasterError),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("malformed token name: {0}")]
    MalformedName(String),

    #[error("parser error: {0}")]
    Parser(#[from] crate::parser::ParserError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
