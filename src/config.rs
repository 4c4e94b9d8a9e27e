//! Configuration for tokenmill processes.

use std::path::PathBuf;

/// Configuration for the master process.
pub struct MasterConfig {
    /// Address to listen on for gRPC connections (e.g., "0.0.0.0:9690").
    pub listen_address: String,

    /// Directory of the persistent token store.
    pub store_path: PathBuf,
}

impl MasterConfig {
    pub fn new(listen_address: String, store_path: PathBuf) -> Self {
        Self {
            listen_address,
            store_path,
        }
    }
}

/// Configuration for worker processes.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Address of the master (host:port).
    pub master_address: String,

    /// How long a claimed job token is leased before it must be renewed.
    pub lease_secs: i64,

    /// Base delay between claim attempts; actual sleeps are jittered.
    pub poll_secs: u64,

    /// Worker-cohort tag compared against EXIT signals during rolling
    /// upgrades.
    pub generation: u64,

    /// How long a finished instance lingers before it is archived.
    pub archive_delay_secs: i64,
}

impl WorkerConfig {
    pub fn new(master_address: String) -> Self {
        Self {
            master_address,
            lease_secs: 20 * 60,
            poll_secs: 5,
            generation: 1,
            archive_delay_secs: 0,
        }
    }

    pub fn with_lease_secs(mut self, lease_secs: i64) -> Self {
        self.lease_secs = lease_secs;
        self
    }

    pub fn with_poll_secs(mut self, poll_secs: u64) -> Self {
        self.poll_secs = poll_secs;
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_archive_delay_secs(mut self, archive_delay_secs: i64) -> Self {
        self.archive_delay_secs = archive_delay_secs;
        self
    }
}

/// Configuration for the scheduler process.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Address of the master (host:port).
    pub master_address: String,

    /// How long a schedule token is held while being manipulated.
    pub lease_secs: i64,

    /// Sleep between claim attempts when no schedule is due.
    pub poll_secs: u64,

    /// How long a delayed schedule waits before the next overrun check.
    pub delay_secs: i64,
}

impl SchedulerConfig {
    pub fn new(master_address: String) -> Self {
        Self {
            master_address,
            lease_secs: 5 * 60,
            poll_secs: 10,
            delay_secs: 5 * 60,
        }
    }

    pub fn with_lease_secs(mut self, lease_secs: i64) -> Self {
        self.lease_secs = lease_secs;
        self
    }

    pub fn with_poll_secs(mut self, poll_secs: u64) -> Self {
        self.poll_secs = poll_secs;
        self
    }

    pub fn with_delay_secs(mut self, delay_secs: i64) -> Self {
        self.delay_secs = delay_secs;
        self
    }
}
