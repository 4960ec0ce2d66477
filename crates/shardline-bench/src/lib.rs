//! Shardline Benchmark Suite
//!
//! # Benchmark Categories
//!
//! - **Routing**: shard key hashing and writable bucket resolution
//! - **Upgrade**: paginated copy between topology versions

pub mod fixtures;
pub mod harness;

pub use fixtures::{generate_activities, generate_keys, Scale};
pub use harness::TestContext;
