//! Database configuration.

use std::time::Duration;

/// Default core storage kind.
pub const DEFAULT_CORE_KIND: &str = "memory";

/// Default core storage dsn.
pub const DEFAULT_CORE_DSN: &str = "core";

/// Default number of change entries fetched per poll.
pub const DEFAULT_CHANGE_BATCH_SIZE: usize = 100;

/// Default rows per migration page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default wait between empty replication polls, in milliseconds.
pub const DEFAULT_REPLICATION_DELAY_MS: u64 = 1000;

/// Configuration of a [`Database`](crate::Database) handle.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Driver kind of the core storage.
    pub core_kind: String,

    /// Connection string of the core storage.
    pub core_dsn: String,

    /// Change entries fetched per `get_changes` call by the jobs.
    pub change_batch_size: usize,

    /// Rows per page when copying between topology versions.
    pub page_size: usize,

    /// Wait between empty replication polls.
    pub replication_delay: Duration,
}

impl DatabaseConfig {
    /// Configuration with the given core storage.
    pub fn new(core_kind: impl Into<String>, core_dsn: impl Into<String>) -> Self {
        Self {
            core_kind: core_kind.into(),
            core_dsn: core_dsn.into(),
            change_batch_size: DEFAULT_CHANGE_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            replication_delay: Duration::from_millis(DEFAULT_REPLICATION_DELAY_MS),
        }
    }

    /// Set the change batch size.
    pub fn with_change_batch_size(mut self, size: usize) -> Self {
        self.change_batch_size = size.max(1);
        self
    }

    /// Set the migration page size.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Set the replication poll delay.
    pub fn with_replication_delay(mut self, delay: Duration) -> Self {
        self.replication_delay = delay;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CORE_KIND, DEFAULT_CORE_DSN)
    }
}
