pub mod config;
pub mod grpc;
pub mod master;
pub mod parser;
pub mod scheduler;
pub mod storage;
pub mod workflow;

// The generated Token is the one token type used everywhere: on the wire,
// in the index, and in the store.
pub use grpc::proto::{Token, TokenQuery};

pub use config::{MasterConfig, SchedulerConfig, WorkerConfig};
pub use grpc::{start_grpc_server, GrpcServerHandle, MasterClient};
pub use master::{MasterError, MasterHandle, MasterState};
pub use parser::{JobDefinition, ParserError, WorkflowDefinition};
pub use scheduler::{OverrunPolicy, ScheduleRecord, Scheduler};
pub use storage::{EphemeralStore, RocksStore, TokenStore};
pub use workflow::{
    Archiver, EventRecord, ExecutionRecord, Inspector, JobExecutor, JobRecord, ShellExecutor,
    SignalAction, SignalRecord, Signaller, TokenName, Worker, WorkflowError,
};
