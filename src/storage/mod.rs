//! Durable write-through persistence for the token master.
//!
//! The master keeps its whole current namespace in memory; the store exists
//! so that restarts are correct.  A commit is atomic across the current and
//! archive namespaces and must be durable before it returns, because the
//! master acknowledges clients only after the store does.
//!
//! The archive side is never loaded by the master.  It is a read path for
//! external viewers (the UI reads it directly through `read_archive`).

mod memory;
mod rocks;

pub use memory::EphemeralStore;
pub use rocks::RocksStore;

use thiserror::Error;

use crate::grpc::proto::Token;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] prost::DecodeError),

    #[error("store error: {0}")]
    Other(String),
}

/// One atomic, durable unit of change.
///
/// `updates` and `deletes` touch the current namespace; `archives` are
/// tokens being written under the archive namespace (with their final,
/// already-prefixed names).  `version_counter` rides along so the version
/// source survives restarts.
#[derive(Debug, Default)]
pub struct CommitBatch {
    pub updates: Vec<Token>,
    pub deletes: Vec<String>,
    pub archives: Vec<Token>,
    pub version_counter: i64,
}

/// A persistent token container.
pub trait TokenStore: Send + Sync {
    /// Apply the batch transactionally and durably, then return.
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError>;

    /// All current-namespace tokens, for the startup rebuild.
    fn load_current(&self) -> Result<Vec<Token>, StoreError>;

    /// The last committed version counter, zero on a fresh store.
    fn load_version_counter(&self) -> Result<i64, StoreError>;

    /// Current-namespace tokens under a name prefix, ascending by name.
    /// Read-side contract for external viewers; not on the master's
    /// critical path.
    fn read_current(&self, prefix: &str) -> Result<Vec<Token>, StoreError>;

    /// Archive-namespace tokens under a name prefix, ascending by name.
    fn read_archive(&self, prefix: &str) -> Result<Vec<Token>, StoreError>;
}

// Shared stores: lets a test or an embedding process keep a read handle on
// the store it hands to the master.
impl<T: TokenStore + ?Sized> TokenStore for std::sync::Arc<T> {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        (**self).commit(batch)
    }

    fn load_current(&self) -> Result<Vec<Token>, StoreError> {
        (**self).load_current()
    }

    fn load_version_counter(&self) -> Result<i64, StoreError> {
        (**self).load_version_counter()
    }

    fn read_current(&self, prefix: &str) -> Result<Vec<Token>, StoreError> {
        (**self).read_current(prefix)
    }

    fn read_archive(&self, prefix: &str) -> Result<Vec<Token>, StoreError> {
        (**self).read_archive(prefix)
    }
}
