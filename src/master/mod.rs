//! The token master: an atomic, versioned, hierarchical key-value store
//! with prefix queries, ownership leases, and durable write-through
//! persistence.

pub mod error;
pub mod handler;
pub mod index;
pub mod node;
pub mod version;

pub use error::{MasterError, Result};
pub use handler::{is_owned, now_secs, MasterHandler, ARCHIVE_PREFIX};
pub use node::{spawn, MasterHandle, MasterState};
pub use version::VersionSource;
