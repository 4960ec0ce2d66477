//! Feeding replica buckets from their primary's change log.
//!
//! Storages hosting a primary with replicas track every segment table for
//! the `replication` listener. [`Replicate`] drains that log on one
//! storage, applies each change to every replica of the shard and
//! acknowledges the batch. Delivery is at-least-once; applying a change is
//! idempotent.

mod applier;
mod replicate;
mod targets;

pub use applier::Applier;
pub use replicate::{Replicate, ReplicateResult};
pub use targets::{Target, Targets};
