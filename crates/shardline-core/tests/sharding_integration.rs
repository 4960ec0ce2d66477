//! Integration tests for routing, resharding and replication.

use std::collections::BTreeSet;
use std::sync::Arc;

use shardline_core::driver::{MIGRATION_LISTENER, REPLICATION_LISTENER};
use shardline_core::{
    row, Configure, Database, DatabaseConfig, EntityRef, FieldDef, FieldType, FixedCaster, Migrate,
    Model, Registry, Replicate, Row, SchemaFile, Segment, TopologyStatus, Upgrade, Value,
};

struct TestContext {
    db: Database,
    _dirs: Vec<tempfile::TempDir>,
}

impl TestContext {
    /// Memory core plus `storages` sled storages in temporary directories.
    fn new(registry: Registry, storages: usize) -> Self {
        let db = Database::open(DatabaseConfig::default().with_page_size(4), registry).unwrap();
        let mut dirs = Vec::new();
        for _ in 0..storages {
            let dir = tempfile::tempdir().unwrap();
            db.register_storage("sled", dir.path().to_str().unwrap(), 1)
                .unwrap();
            dirs.push(dir);
        }
        Self { db, _dirs: dirs }
    }

    fn activity() -> Self {
        Self::new(activity_registry(), 5)
    }

    fn entity(&self) -> EntityRef {
        EntityRef::class("Activity")
    }

    fn populate(&self, count: i64) {
        for i in 1..=count {
            self.db
                .create(&self.entity(), row! { "kind" => format!("event-{}", i) })
                .unwrap();
        }
    }

    fn replicate(&self, storage: u64) -> usize {
        let job = Replicate::new(storage).until_idle();
        self.db.run(&job).unwrap().processed
    }
}

fn activity_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            Segment::new("app", "activity").with_model(
                Model::new("Activity").with_field(FieldDef::new("kind", FieldType::String)),
            ),
        )
        .unwrap();
    registry
}

#[test]
fn test_writable_resolution_is_stable() {
    let ctx = TestContext::activity();
    ctx.db.run(&Configure::new("activity").shards(3)).unwrap();

    for id in 0..12i64 {
        let data = row! { "id" => id };
        let first = ctx
            .db
            .locator()
            .get_buckets(&ctx.entity(), &data, true, false)
            .unwrap();
        let second = ctx
            .db
            .locator()
            .get_buckets(&ctx.entity(), &data, true, false)
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].shard, (id % 3) as u64);
        assert_eq!(first, second);
    }
}

#[test]
fn test_create_find_round_trip_on_sled() {
    let ctx = TestContext::activity();
    let created = ctx
        .db
        .create(&ctx.entity(), row! { "kind" => "login" })
        .unwrap();
    let found = ctx
        .db
        .find_one(&ctx.entity(), &row! { "id" => created["id"].clone() })
        .unwrap();
    assert_eq!(found, Some(created));
}

#[test]
fn test_ack_twice_is_noop() {
    let ctx = TestContext::activity();
    ctx.populate(1);
    let bucket = ctx.db.locator().buckets("activity").unwrap().remove(0);
    let driver = ctx.db.locator().driver(&bucket).unwrap();
    driver.track("audit", "*").unwrap();
    ctx.populate(2);

    let changes = driver.get_changes(Some("audit"), 10).unwrap();
    assert_eq!(changes.len(), 2);
    driver.ack_changes(&changes).unwrap();
    driver.ack_changes(&changes).unwrap();
    assert!(driver.get_changes(Some("audit"), 10).unwrap().is_empty());
}

#[test]
fn test_activity_scenario() {
    let ctx = TestContext::activity();
    ctx.populate(10);

    let draft = ctx
        .db
        .run(&Configure::new("activity").shards(2).replicas(1))
        .unwrap();
    assert_eq!(draft.version, 2);
    assert_eq!(draft.status, TopologyStatus::Draft);

    // a draft cannot be reconfigured
    let err = ctx
        .db
        .run(&Configure::new("activity").shards(4))
        .unwrap_err();
    assert!(err.to_string().contains("Topology is not ready"));

    let result = ctx.db.run(&Migrate::new("activity")).unwrap();
    assert_eq!(result.rows, 10);

    let rows = ctx.db.find(&ctx.entity(), &Row::new()).unwrap();
    assert_eq!(rows.len(), 10);
    let ids: Vec<i64> = rows.iter().filter_map(|r| r["id"].as_i64()).collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    let buckets = ctx.db.locator().buckets("activity").unwrap();
    let next: Vec<_> = buckets.iter().filter(|b| b.version == 2).collect();
    assert_eq!(next.len(), 4);
    let storages: BTreeSet<u64> = buckets.iter().map(|b| b.storage).collect();
    assert_eq!(storages.len(), buckets.len(), "a storage hosts two buckets");

    // replicas are fed by the replication listener of their primary
    let mut replicated = 0;
    for primary in next.iter().filter(|b| b.is_primary()) {
        let driver = ctx.db.locator().driver(primary).unwrap();
        let subscriptions = driver.subscriptions().unwrap();
        assert!(subscriptions
            .iter()
            .any(|s| s.listener == REPLICATION_LISTENER && s.table == "app_activity_activity"));
        replicated += ctx.replicate(primary.storage);
    }
    assert_eq!(replicated, 10);
    for replica in next.iter().filter(|b| !b.is_primary()) {
        let driver = ctx.db.locator().driver(replica).unwrap();
        let primary = next
            .iter()
            .find(|b| b.is_primary() && b.same_shard(replica))
            .unwrap();
        let expected = ctx
            .db
            .locator()
            .driver(primary)
            .unwrap()
            .find("app_activity_activity", &Row::new())
            .unwrap();
        assert_eq!(driver.find("app_activity_activity", &Row::new()).unwrap(), expected);
    }

    // no migration change left pending on the old primary
    let old = buckets.iter().find(|b| b.version == 1).unwrap();
    let old_driver = ctx.db.locator().driver(old).unwrap();
    assert!(old_driver
        .get_changes(Some(MIGRATION_LISTENER), 10)
        .unwrap()
        .is_empty());
}

#[test]
fn test_upgrade_one_iteration_converges() {
    let single = TestContext::activity();
    let stepped = TestContext::activity();
    for ctx in [&single, &stepped] {
        ctx.populate(9);
        ctx.db.run(&Configure::new("activity").shards(2)).unwrap();
    }

    let done = single.db.run(&Upgrade::new("activity")).unwrap();
    assert!(done.complete);

    let mut runs = 0;
    while !stepped
        .db
        .run(&Upgrade::new("activity").iterations(1))
        .unwrap()
        .complete
    {
        runs += 1;
        assert!(runs < 20);
    }

    let all = |ctx: &TestContext| ctx.db.find(&ctx.entity(), &Row::new()).unwrap();
    assert_eq!(all(&single), all(&stepped));
    assert_eq!(all(&stepped).len(), 9);
}

#[test]
fn test_find_or_create_replay_yields_one_row() {
    let ctx = TestContext::activity();
    let filter = row! { "kind" => "signup" };
    for _ in 0..3 {
        ctx.db
            .find_or_create(&ctx.entity(), &filter, Row::new())
            .unwrap();
    }
    assert_eq!(ctx.db.find(&ctx.entity(), &filter).unwrap().len(), 1);
}

#[test]
fn test_caster_override_wins() {
    let mut registry = Registry::new();
    registry
        .register(
            Segment::new("app", "audit")
                .with_model(Model::new("AuditEntry").with_caster(Arc::new(FixedCaster(1)))),
        )
        .unwrap();
    let ctx = TestContext::new(registry, 2);

    ctx.db
        .create(&EntityRef::class("AuditEntry"), row! { "action" => "login" })
        .unwrap();
    let bucket = ctx.db.locator().buckets("audit").unwrap().remove(0);
    assert_eq!(bucket.storage, 1);
}

#[cfg(feature = "sqlite")]
#[test]
fn test_sqlite_storages() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DatabaseConfig::default(), activity_registry()).unwrap();
    for name in ["a.db", "b.db", "c.db"] {
        let path = dir.path().join(name);
        db.register_storage("sqlite", path.to_str().unwrap(), 1)
            .unwrap();
    }
    let activity = EntityRef::class("Activity");
    for i in 1..=5i64 {
        db.create(&activity, row! { "kind" => format!("k{}", i) }).unwrap();
    }
    db.run(&Configure::new("activity").shards(2)).unwrap();
    db.run(&Migrate::new("activity")).unwrap();

    let rows = db.find(&activity, &Row::new()).unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[4]["kind"], Value::from("k5"));
}

#[test]
fn test_sled_core_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let core = dir.path().join("core");
    let config = DatabaseConfig::new("sled", core.to_str().unwrap());

    let storage_dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config.clone(), activity_registry()).unwrap();
        db.register_storage("sled", storage_dir.path().to_str().unwrap(), 1)
            .unwrap();
        db.run(&Configure::new("activity")).unwrap();
        db.create(&EntityRef::class("Activity"), row! { "kind" => "kept" })
            .unwrap();
    }

    let db = Database::open(config, activity_registry()).unwrap();
    assert_eq!(db.storages().unwrap().len(), 2);
    let row = db
        .find_one(&EntityRef::class("Activity"), &row! { "kind" => "kept" })
        .unwrap()
        .unwrap();
    assert_eq!(row["id"], Value::Int(1));
    let next = db
        .create(&EntityRef::class("Activity"), row! { "kind" => "new" })
        .unwrap();
    assert_eq!(next["id"], Value::Int(2));
}

#[test]
fn test_schema_file_registry() {
    let schema = SchemaFile::from_json(
        r#"{
            "segments": [{
                "domain": "chat",
                "name": "messages",
                "models": [{
                    "class": "Message",
                    "fields": [{ "name": "room", "type": "string" }],
                    "key": "room"
                }]
            }]
        }"#,
    )
    .unwrap();
    let ctx = TestContext::new(schema.into_registry().unwrap(), 3);
    ctx.db.run(&Configure::new("messages").shards(2)).unwrap();

    let messages = EntityRef::table("messages.Message");
    for room in ["general", "random", "general"] {
        ctx.db.create(&messages, row! { "room" => room }).unwrap();
    }
    let general = ctx.db.find(&messages, &row! { "room" => "general" }).unwrap();
    assert_eq!(general.len(), 2);
    let buckets = ctx
        .db
        .locator()
        .get_buckets(&messages, &row! { "room" => "general" }, false, false)
        .unwrap();
    assert_eq!(buckets.len(), 1);
}
