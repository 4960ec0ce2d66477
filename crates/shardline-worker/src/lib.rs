//! Shardline Worker - runs topology, migration and replication jobs.

pub mod commands;
pub mod config;
pub mod error;

pub use commands::{execute, open};
pub use config::{Args, Command, StorageCommand, WorkerConfig};
pub use error::Error;
