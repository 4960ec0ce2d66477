//! Benchmark harness helpers.

use shardline_core::{Configure, Database, DatabaseConfig, EntityRef};

use crate::fixtures::{generate_activities, registry, Scale};

/// Database over temporary sled storages.
pub struct TestContext {
    pub db: Database,
    _dirs: Vec<tempfile::TempDir>,
}

impl TestContext {
    /// A memory core and `storages` sled storages.
    pub fn new(storages: usize) -> Self {
        let db = Database::open(DatabaseConfig::default(), registry()).expect("open database");
        let mut dirs = Vec::with_capacity(storages);
        for _ in 0..storages {
            let dir = tempfile::tempdir().expect("temporary directory");
            let dsn = dir.path().to_str().expect("utf-8 path").to_string();
            db.register_storage("sled", &dsn, 1).expect("register storage");
            dirs.push(dir);
        }
        Self { db, _dirs: dirs }
    }

    /// `shards` shards of the activity segment.
    pub fn with_shards(shards: u64) -> Self {
        let ctx = Self::new(shards as usize * 2 + 1);
        ctx.db
            .run(&Configure::new("activity").shards(shards))
            .expect("configure");
        ctx
    }

    /// Activity rows at `scale` on a single shard, with a two-shard draft
    /// waiting to be populated.
    pub fn with_pending_upgrade(scale: Scale) -> Self {
        let ctx = Self::new(4);
        let activity = EntityRef::class("Activity");
        for row in generate_activities(scale.count()) {
            ctx.db.create(&activity, row).expect("create");
        }
        ctx.db
            .run(&Configure::new("activity").shards(2))
            .expect("configure");
        ctx
    }
}
