//! The `Database` handle: routed CRUD over every registered storage.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::DatabaseConfig;
use crate::driver::{sort_by_id, Connector, DefaultConnector, Driver, DriverPool, Select};
use crate::error::Error;
use crate::job::Job;
use crate::locator::{system_segment, Bucket, Locator, Storage, SYSTEM_SEGMENT};
use crate::registry::{sync_segment, EntityRef, FieldType, Registry, Resolved};
use crate::value::{row_id, Context, Row, Value, ID_FIELD};

/// Entry point for applications and jobs.
///
/// Owns the registry, the connected drivers and the locator. Every data
/// operation resolves its buckets first and then runs on their drivers.
///
/// ```
/// use shardline_core::{row, Database, DatabaseConfig, EntityRef, Model, Registry, Segment};
///
/// let mut registry = Registry::new();
/// registry
///     .register(Segment::new("app", "notes").with_model(Model::new("Note")))
///     .unwrap();
/// let db = Database::open(DatabaseConfig::default(), registry).unwrap();
///
/// let note = EntityRef::class("Note");
/// let created = db.create(&note, row! { "text" => "hello" }).unwrap();
/// assert_eq!(db.find(&note, &row! { "text" => "hello" }).unwrap(), vec![created]);
/// ```
pub struct Database {
    registry: Arc<Registry>,
    pool: Arc<DriverPool>,
    locator: Locator,
    config: DatabaseConfig,
    context: RwLock<Context>,
}

impl Database {
    /// Open with the drivers shipped in this crate.
    pub fn open(config: DatabaseConfig, registry: Registry) -> Result<Self, Error> {
        Self::open_with_connector(config, registry, Arc::new(DefaultConnector::new()))
    }

    /// Open with a custom connector.
    ///
    /// Registers the system segment, connects the core storage and
    /// synchronises the system tables on it.
    pub fn open_with_connector(
        config: DatabaseConfig,
        mut registry: Registry,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, Error> {
        registry.register_system(system_segment(Storage::core(
            config.core_kind.as_str(),
            config.core_dsn.as_str(),
        )))?;
        let registry = Arc::new(registry);

        let core = connector.connect(&config.core_kind, &config.core_dsn)?;
        if let Some(system) = registry.segment(SYSTEM_SEGMENT) {
            sync_segment(core.as_ref(), system)?;
        }

        let pool = Arc::new(DriverPool::new(core, connector));
        let locator = Locator::new(registry.clone(), pool.clone());
        tracing::info!(
            kind = %config.core_kind,
            dsn = %config.core_dsn,
            segments = registry.segments().count(),
            "database opened"
        );

        Ok(Self {
            registry,
            pool,
            locator,
            config,
            context: RwLock::new(Context::new()),
        })
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The core driver.
    pub fn core(&self) -> &Arc<dyn Driver> {
        self.pool.core()
    }

    /// The locator.
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Connected drivers.
    pub fn pool(&self) -> &Arc<DriverPool> {
        &self.pool
    }

    /// Configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Register a storage backend.
    pub fn register_storage(&self, kind: &str, dsn: &str, tier: u64) -> Result<Storage, Error> {
        self.pool.register(kind, dsn, tier)
    }

    /// Registered storages.
    pub fn storages(&self) -> Result<Vec<Storage>, Error> {
        self.pool.storages()
    }

    /// Context attached to every following mutation's changes.
    pub fn set_context(&self, context: Context) {
        *self.context.write() = context;
    }

    /// The current context.
    pub fn context(&self) -> Context {
        self.context.read().clone()
    }

    /// Run a job.
    pub fn run<J: Job>(&self, job: &J) -> Result<J::Output, Error> {
        job.run(self)
    }

    /// Create a row.
    ///
    /// Integer ids are drawn from the core sequence of the table when
    /// missing, so they stay unique across shards.
    pub fn create(&self, entity: &EntityRef, mut data: Row) -> Result<Row, Error> {
        let resolved = self.registry.resolve(entity)?;
        if row_id(&data).is_none()
            && resolved.model.id_type() == FieldType::Int
            && !self.registry.is_system(&resolved.segment.name)
        {
            let id = self.core().next_sequence(resolved.table())?;
            data.insert(ID_FIELD.to_string(), Value::Int(id));
        }
        resolved.model.apply_defaults(&mut data);

        let driver = self.writable(entity, &resolved, &data)?;
        driver.create(resolved.table(), data)
    }

    /// Rows matching `filter` across every shard it may live in.
    pub fn find(&self, entity: &EntityRef, filter: &Row) -> Result<Vec<Row>, Error> {
        let resolved = self.registry.resolve(entity)?;
        let mut rows = Vec::new();
        for driver in self.readable(entity, filter)? {
            rows.extend(driver.find(resolved.table(), filter)?);
        }
        sort_by_id(&mut rows);
        Ok(rows)
    }

    /// First row matching `filter`.
    pub fn find_one(&self, entity: &EntityRef, filter: &Row) -> Result<Option<Row>, Error> {
        let resolved = self.registry.resolve(entity)?;
        for driver in self.readable(entity, filter)? {
            if let Some(row) = driver.find_one(resolved.table(), filter)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// First row matching `filter`, or [`Error::NotFound`].
    pub fn find_or_fail(&self, entity: &EntityRef, filter: &Row) -> Result<Row, Error> {
        let resolved = self.registry.resolve(entity)?;
        self.find_one(entity, filter)?.ok_or_else(|| Error::NotFound {
            what: resolved.table().to_string(),
        })
    }

    /// First row matching `filter`, created from `filter` + `data` when
    /// there is none.
    pub fn find_or_create(&self, entity: &EntityRef, filter: &Row, data: Row) -> Result<Row, Error> {
        if let Some(row) = self.find_one(entity, filter)? {
            return Ok(row);
        }
        let mut merged = filter.clone();
        merged.extend(data);
        self.create(entity, merged)
    }

    /// Filtered, id-ordered and limited rows across shards.
    pub fn select(&self, entity: &EntityRef, select: &Select) -> Result<Vec<Row>, Error> {
        let resolved = self.registry.resolve(entity)?;
        let mut rows = Vec::new();
        for driver in self.readable(entity, &Row::new())? {
            rows.extend(driver.select(resolved.table(), select)?);
        }
        Ok(select.apply(rows))
    }

    /// Update a row by id. Returns the updated row, `None` when missing.
    pub fn update(&self, entity: &EntityRef, id: &Value, data: Row) -> Result<Option<Row>, Error> {
        let resolved = self.registry.resolve(entity)?;
        let context = self.context();
        for driver in self.readable(entity, &id_filter(id))? {
            driver.set_context(context.clone());
            if let Some(row) = driver.update(resolved.table(), id, data.clone())? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Delete a row by id. Returns the removed row, `None` when missing.
    pub fn delete(&self, entity: &EntityRef, id: &Value) -> Result<Option<Row>, Error> {
        let resolved = self.registry.resolve(entity)?;
        let context = self.context();
        for driver in self.readable(entity, &id_filter(id))? {
            driver.set_context(context.clone());
            if let Some(row) = driver.delete(resolved.table(), id)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Drivers of the primaries that may hold rows for `filter`.
    ///
    /// Buckets never written to have no storage and are skipped.
    fn readable(&self, entity: &EntityRef, filter: &Row) -> Result<Vec<Arc<dyn Driver>>, Error> {
        self.locator
            .get_buckets(entity, filter, false, true)?
            .iter()
            .filter(|b| b.is_assigned())
            .map(|b| self.locator.driver(b))
            .collect()
    }

    fn writable(
        &self,
        entity: &EntityRef,
        resolved: &Resolved,
        data: &Row,
    ) -> Result<Arc<dyn Driver>, Error> {
        let buckets = self.locator.get_buckets(entity, data, true, false)?;
        let bucket: &Bucket = buckets
            .first()
            .ok_or_else(|| Error::NoBuckets(resolved.segment.name.clone()))?;
        let driver = self.locator.driver(bucket)?;
        driver.set_context(self.context());
        Ok(driver)
    }
}

fn id_filter(id: &Value) -> Row {
    let mut row = Row::new();
    row.insert(ID_FIELD.to_string(), id.clone());
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Action, REPLICATION_LISTENER};
    use crate::registry::{FieldDef, IndexDef, Model, Segment};
    use crate::row;
    use crate::topology::Configure;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                Segment::new("app", "activity").with_model(
                    Model::new("Activity")
                        .with_field(FieldDef::new("kind", FieldType::String))
                        .with_field(FieldDef::new("seen", FieldType::Bool).with_default(false)),
                ),
            )
            .unwrap();
        registry
            .register(
                Segment::new("app", "users").with_model(
                    Model::new("User")
                        .with_field(FieldDef::new("email", FieldType::String))
                        .with_index(IndexDef::unique("email", &["email"])),
                ),
            )
            .unwrap();
        registry
    }

    fn open() -> Database {
        Database::open(DatabaseConfig::default(), registry()).unwrap()
    }

    #[test]
    fn test_create_and_find_one() {
        let db = open();
        let activity = EntityRef::class("Activity");
        let created = db.create(&activity, row! { "kind" => "login" }).unwrap();
        assert_eq!(created["id"], Value::Int(1));
        assert_eq!(created["seen"], Value::Bool(false));

        let found = db.find_one(&activity, &row! { "id" => 1 }).unwrap().unwrap();
        assert_eq!(found, created);
        assert!(db.find_one(&activity, &row! { "id" => 2 }).unwrap().is_none());
        assert!(matches!(
            db.find_or_fail(&activity, &row! { "id" => 2 }),
            Err(Error::NotFound { what }) if what == "app_activity_activity"
        ));
    }

    #[test]
    fn test_reads_before_any_write() {
        let db = open();
        let activity = EntityRef::class("Activity");
        assert!(db.find(&activity, &Row::new()).unwrap().is_empty());
        assert!(db.update(&activity, &Value::Int(1), row! { "kind" => "x" }).unwrap().is_none());
    }

    #[test]
    fn test_find_or_create_once() {
        let db = open();
        let users = EntityRef::table("users.User");
        let filter = row! { "email" => "a@example.com" };
        let first = db.find_or_create(&users, &filter, Row::new()).unwrap();
        let second = db.find_or_create(&users, &filter, Row::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.find(&users, &Row::new()).unwrap().len(), 1);
        assert!(matches!(
            db.create(&users, row! { "email" => "a@example.com" }),
            Err(Error::UniqueViolation { .. })
        ));
    }

    #[test]
    fn test_update_delete_with_context() {
        let db = open();
        let activity = EntityRef::class("Activity");
        let core = db.core().clone();
        core.track("audit", "*").unwrap();

        db.set_context(row! { "user" => "alice" });
        let row = db.create(&activity, row! { "kind" => "login" }).unwrap();
        let id = row["id"].clone();
        let updated = db.update(&activity, &id, row! { "seen" => true }).unwrap().unwrap();
        assert_eq!(updated["seen"], Value::Bool(true));
        assert_eq!(updated["kind"], Value::from("login"));
        assert!(db.delete(&activity, &id).unwrap().is_some());
        assert!(db.delete(&activity, &id).unwrap().is_none());

        let changes: Vec<_> = core
            .get_changes(Some("audit"), 100)
            .unwrap()
            .into_iter()
            .filter(|c| c.table == "app_activity_activity")
            .collect();
        let actions: Vec<Action> = changes.iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![Action::Create, Action::Update, Action::Delete]);
        assert!(changes
            .iter()
            .all(|c| c.context.get("user") == Some(&Value::from("alice"))));
        assert!(core.get_changes(Some(REPLICATION_LISTENER), 10).unwrap().is_empty());
    }

    #[test]
    fn test_ids_unique_across_shards() {
        let db = open();
        for i in 0..2 {
            db.register_storage("memory", &format!("shard-{}", i), 1).unwrap();
        }
        db.run(&Configure::new("activity").shards(2)).unwrap();

        let activity = EntityRef::class("Activity");
        for _ in 0..6 {
            db.create(&activity, row! { "kind" => "view" }).unwrap();
        }
        let rows = db.find(&activity, &Row::new()).unwrap();
        let ids: Vec<i64> = rows.iter().filter_map(|r| r["id"].as_i64()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

        let buckets = db.locator().buckets("activity").unwrap();
        assert_eq!(buckets.iter().filter(|b| b.is_assigned()).count(), 2);

        let page = db
            .select(&activity, &Select::new().where_field("id").greater_than(2).limit(3))
            .unwrap();
        let ids: Vec<i64> = page.iter().filter_map(|r| r["id"].as_i64()).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_system_entities_route_to_core() {
        let db = open();
        let storages = db
            .find(&EntityRef::of::<Storage>(), &Row::new())
            .unwrap();
        assert_eq!(storages.len(), 1);
        assert_eq!(db.storages().unwrap()[0].id, crate::locator::CORE_STORAGE_ID);
    }
}
