//! Core error types.

use thiserror::Error;

/// Errors raised by the registry, drivers, locator and jobs.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error from the sled driver.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Storage layer error from the sqlite driver.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A `find_or_fail` lookup matched nothing.
    #[error("No {what} found")]
    NotFound {
        /// What was looked up (table or entity name).
        what: String,
    },

    /// The entity is not registered in any segment.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// No driver is known for the storage kind.
    #[error("unknown driver kind: {0}")]
    UnknownDriver(String),

    /// No storage row exists for the id.
    #[error("unknown storage: {0}")]
    UnknownStorage(u64),

    /// Topology name does not match a registered segment.
    #[error("invalid topology name: {0}")]
    InvalidTopologyName(String),

    /// Reconfiguration or migration requires a ready topology.
    #[error("Topology is not ready: {name} v{version} is {status}")]
    TopologyNotReady {
        /// Segment name.
        name: String,
        /// Topology version.
        version: u64,
        /// Current status.
        status: String,
    },

    /// Migration requires the next topology to be a draft.
    #[error("Topology is not a draft: {name} v{version} is {status}")]
    TopologyNotDraft {
        /// Segment name.
        name: String,
        /// Topology version.
        version: u64,
        /// Current status.
        status: String,
    },

    /// Migration needs a current and a next topology.
    #[error("insufficient topology history for {0}")]
    InsufficientTopology(String),

    /// Illegal topology status transition.
    #[error("invalid topology transition: {from} -> {to}")]
    InvalidTransition {
        /// Status before.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A writable (or single) resolution matched more than one bucket.
    #[error("multiple buckets for {name}: {count}")]
    MultipleBuckets {
        /// Segment name.
        name: String,
        /// Number of candidate buckets.
        count: usize,
    },

    /// A resolution matched no bucket at all.
    #[error("no bucket for {0}")]
    NoBuckets(String),

    /// Every storage is already used by a sibling bucket.
    #[error("no available storage for {segment}")]
    NoAvailableStorage {
        /// Segment name.
        segment: String,
    },

    /// Changes captured during a bulk migration were left unapplied.
    #[error("Migration changes not applied: {count} pending")]
    MigrationChangesNotApplied {
        /// Number of pending changes.
        count: usize,
    },

    /// A unique index rejected the write.
    #[error("unique violation on {table}.{index}")]
    UniqueViolation {
        /// Physical table name.
        table: String,
        /// Index name.
        index: String,
    },

    /// A replicated change refers to a table with no destination.
    #[error("unknown replication target: {0}")]
    UnknownReplicationTarget(String),

    /// A change log row carries an action this build does not know.
    #[error("unknown change action: {0}")]
    UnknownAction(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
