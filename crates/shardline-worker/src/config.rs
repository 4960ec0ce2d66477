//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use shardline_core::config::{
    DEFAULT_CHANGE_BATCH_SIZE, DEFAULT_CORE_DSN, DEFAULT_CORE_KIND, DEFAULT_PAGE_SIZE,
    DEFAULT_REPLICATION_DELAY_MS,
};
use shardline_core::locator::DEFAULT_TIER;
use shardline_core::{DatabaseConfig, Registry, SchemaFile};

use crate::error::Error;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Database configuration.
    pub database: DatabaseConfig,

    /// Schema file describing the segments, if any.
    pub schema: Option<PathBuf>,

    /// Job to run.
    pub command: Command,
}

impl WorkerConfig {
    /// Create a configuration running `command` against the default core.
    pub fn new(command: Command) -> Self {
        Self {
            database: DatabaseConfig::default(),
            schema: None,
            command,
        }
    }

    /// Set the database configuration.
    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    /// Set the schema file.
    pub fn with_schema(mut self, schema: impl Into<PathBuf>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Build the registry from the schema file, empty without one.
    pub fn registry(&self) -> Result<Registry, Error> {
        match &self.schema {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "schema file {} does not exist",
                        path.display()
                    )));
                }
                Ok(SchemaFile::load(path)?.into_registry()?)
            }
            None => Ok(Registry::new()),
        }
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "shardline-worker")]
#[command(version, about = "Shardline job runner", long_about = None)]
pub struct Args {
    /// Driver kind of the core storage (memory, sled, sqlite)
    #[arg(long, default_value = DEFAULT_CORE_KIND)]
    pub core_kind: String,

    /// Connection string of the core storage
    #[arg(long, default_value = DEFAULT_CORE_DSN)]
    pub core_dsn: String,

    /// JSON schema file with the segments to register
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Change entries fetched per poll
    #[arg(long, default_value_t = DEFAULT_CHANGE_BATCH_SIZE)]
    pub batch_size: usize,

    /// Rows per migration page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Job to run
    #[command(subcommand)]
    pub command: Command,
}

/// Jobs the worker can run.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create or change the topology of a segment
    Configure {
        /// Segment name
        name: String,

        /// Shard count
        #[arg(long)]
        shards: Option<u64>,

        /// Replicas per shard
        #[arg(long)]
        replicas: Option<u64>,

        /// Storage tier
        #[arg(long)]
        tier: Option<u64>,
    },

    /// Move a segment to its draft topology in one pass
    Migrate {
        /// Segment name
        name: String,
    },

    /// Move a segment to its draft topology in resumable steps
    Upgrade {
        /// Segment name
        name: String,

        /// Pages copied by this run (unbounded when omitted)
        #[arg(long)]
        iterations: Option<usize>,
    },

    /// Drain a storage's replication log into replica buckets
    Replicate {
        /// Storage id
        storage: u64,

        /// Milliseconds to wait after an empty poll
        #[arg(long, default_value_t = DEFAULT_REPLICATION_DELAY_MS)]
        delay_ms: u64,

        /// Stop after this many changes
        #[arg(long)]
        limit: Option<usize>,

        /// Exit once the log is empty
        #[arg(long)]
        until_idle: bool,
    },

    /// Manage storages
    #[command(subcommand)]
    Storage(StorageCommand),
}

/// Storage management.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum StorageCommand {
    /// Register a storage
    Add {
        /// Driver kind (memory, sled, sqlite)
        kind: String,

        /// Connection string
        dsn: String,

        /// Storage tier
        #[arg(long, default_value_t = DEFAULT_TIER)]
        tier: u64,
    },

    /// List registered storages
    List,
}

impl Args {
    /// Convert command-line arguments to worker configuration.
    pub fn into_config(self) -> WorkerConfig {
        let database = DatabaseConfig::new(self.core_kind, self.core_dsn)
            .with_change_batch_size(self.batch_size)
            .with_page_size(self.page_size);
        let database = match &self.command {
            Command::Replicate { delay_ms, .. } => {
                database.with_replication_delay(Duration::from_millis(*delay_ms))
            }
            _ => database,
        };

        WorkerConfig {
            database,
            schema: self.schema,
            command: self.command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_args() {
        let args = Args::parse_from([
            "shardline-worker",
            "--core-kind",
            "sled",
            "--core-dsn",
            "/var/lib/shardline",
            "configure",
            "activity",
            "--shards",
            "4",
        ]);
        let config = args.into_config();
        assert_eq!(config.database.core_kind, "sled");
        assert_eq!(config.database.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(
            config.command,
            Command::Configure {
                name: "activity".to_string(),
                shards: Some(4),
                replicas: None,
                tier: None,
            }
        );
    }

    #[test]
    fn test_replicate_delay() {
        let config = Args::parse_from(["shardline-worker", "replicate", "3", "--delay-ms", "50"])
            .into_config();
        assert_eq!(config.database.replication_delay, Duration::from_millis(50));
        assert!(matches!(
            config.command,
            Command::Replicate { storage: 3, limit: None, until_idle: false, .. }
        ));
    }

    #[test]
    fn test_storage_add() {
        let config =
            Args::parse_from(["shardline-worker", "storage", "add", "sqlite", "a.db", "--tier", "2"])
                .into_config();
        assert_eq!(
            config.command,
            Command::Storage(StorageCommand::Add {
                kind: "sqlite".to_string(),
                dsn: "a.db".to_string(),
                tier: 2,
            })
        );
    }

    #[test]
    fn test_missing_schema() {
        let config = WorkerConfig::new(Command::Storage(StorageCommand::List))
            .with_schema("/nonexistent/schema.json");
        assert!(matches!(config.registry(), Err(Error::Config(_))));
    }
}
