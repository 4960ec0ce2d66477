//! Shardline Core - bucket location, topology, migration and replication.
//!
//! This crate routes entities to storage buckets spread over pluggable
//! storage drivers, manages resharding between topology versions and feeds
//! replica buckets from their primary's change log.

pub mod config;
pub mod database;
pub mod driver;
pub mod error;
pub mod job;
pub mod locator;
pub mod migration;
pub mod registry;
pub mod replication;
pub mod topology;
pub mod value;

pub use config::DatabaseConfig;
pub use database::Database;
pub use driver::{
    Action, Change, Connector, DefaultConnector, Driver, DriverKind, DriverPool, MemoryDriver,
    Select, SledDriver, Subscription,
};
pub use error::Error;
pub use job::Job;
pub use locator::{
    Bucket, CastContext, FixedCaster, Locator, Storage, StorageCaster, UsageCaster,
};
pub use migration::{Migrate, MigrateResult, MigrationCursor, Upgrade, UpgradeResult};
pub use registry::{
    Entity, EntityRef, FieldDef, FieldType, IndexDef, Model, Registry, SchemaFile, Segment,
};
pub use replication::{Replicate, ReplicateResult};
pub use topology::{Configure, Topology, TopologyStatus};
pub use value::{Context, Row, Value};

// Relational driver
#[cfg(feature = "sqlite")]
pub use driver::SqliteDriver;
