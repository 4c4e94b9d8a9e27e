//! Monotonic version source.
//!
//! Every insert or update gets a version that is unique across the lifetime
//! of the master, restarts included.  Values are based on wall-clock
//! milliseconds so a version roughly encodes when a token was last touched,
//! which helps debugging; callers must not assume anything about version
//! values beyond uniqueness and monotonicity.

use std::time::{SystemTime, UNIX_EPOCH};

/// Generates strictly increasing version numbers.
///
/// The last issued value is committed to the store with every batch, so a
/// restarted master resumes above everything it ever handed out.
#[derive(Debug)]
pub struct VersionSource {
    current: i64,
}

impl VersionSource {
    /// Resume from the counter value recovered from the store.
    pub fn resume(current: i64) -> Self {
        Self { current }
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Issue the next version.
    pub fn next(&mut self) -> i64 {
        self.current = std::cmp::max(self.current + 1, Self::now_millis());
        self.current
    }

    /// The most recently issued version.
    pub fn current(&self) -> i64 {
        self.current
    }
}
