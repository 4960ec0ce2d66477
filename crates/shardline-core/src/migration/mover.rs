//! Steps shared by `Migrate` and `Upgrade`.

use std::sync::Arc;

use crate::database::Database;
use crate::driver::{Action, Driver, Select, MIGRATION_LISTENER};
use crate::error::Error;
use crate::locator::{shard_of, Bucket};
use crate::registry::{Model, Segment};
use crate::topology::{Topology, TopologyStatus};
use crate::value::{row_id, Row, Value, ID_FIELD};

/// A prepared move from the current topology version to the next one.
pub(crate) struct Plan<'a> {
    db: &'a Database,
    pub segment: Arc<Segment>,
    pub current: Topology,
    pub next: Topology,
    /// Assigned primaries of the current version, by shard.
    pub sources: Vec<Bucket>,
    /// Primaries of the next version, by shard.
    targets: Vec<Bucket>,
}

impl<'a> Plan<'a> {
    /// Validate the topology pair and set up buckets and listeners.
    ///
    /// The `migration` listener is registered on every source before any
    /// row is read, so writes racing the copy are captured.
    pub fn prepare(db: &'a Database, name: &str) -> Result<Self, Error> {
        let segment = db
            .registry()
            .segment(name)
            .filter(|s| !db.registry().is_system(&s.name))
            .cloned()
            .ok_or_else(|| Error::InvalidTopologyName(name.to_string()))?;

        let core = db.core();
        let mut history = Topology::history(core.as_ref(), name)?;
        if history.len() < 2 {
            return Err(Error::InsufficientTopology(name.to_string()));
        }
        let next = history.remove(history.len() - 1);
        let current = history.remove(history.len() - 1);
        if current.status != TopologyStatus::Ready {
            return Err(Error::TopologyNotReady {
                name: current.name,
                version: current.version,
                status: current.status.to_string(),
            });
        }
        if next.status != TopologyStatus::Draft {
            return Err(Error::TopologyNotDraft {
                name: next.name,
                version: next.version,
                status: next.status.to_string(),
            });
        }

        let locator = db.locator();
        for bucket in locator.buckets_for(&next)? {
            locator.assign_storage(&bucket, Some(&next))?;
        }
        let targets: Vec<Bucket> = locator
            .buckets_for(&next)?
            .into_iter()
            .filter(Bucket::is_primary)
            .collect();

        let sources: Vec<Bucket> = locator
            .buckets(name)?
            .into_iter()
            .filter(|b| b.version == current.version && b.is_primary() && b.is_assigned())
            .collect();
        for source in &sources {
            let driver = locator.driver(source)?;
            driver.register_changes()?;
            for table in segment.tables() {
                driver.track(MIGRATION_LISTENER, &table)?;
            }
        }

        tracing::info!(
            segment = name,
            from = current.version,
            to = next.version,
            sources = sources.len(),
            targets = targets.len(),
            "migration prepared"
        );
        Ok(Self {
            db,
            segment,
            current,
            next,
            sources,
            targets,
        })
    }

    /// Driver of a source bucket.
    pub fn source_driver(&self, bucket: &Bucket) -> Result<Arc<dyn Driver>, Error> {
        self.db.locator().driver(bucket)
    }

    /// Driver of the next-version primary owning `row`.
    fn target_driver(&self, model: &Model, row: &Row) -> Result<Arc<dyn Driver>, Error> {
        let shard = shard_of(model, &self.next, row);
        let bucket = self
            .targets
            .iter()
            .find(|b| b.shard == shard)
            .ok_or_else(|| Error::NoBuckets(self.segment.name.clone()))?;
        self.db.locator().driver(bucket)
    }

    fn model(&self, table: &str) -> Result<&Arc<Model>, Error> {
        self.segment
            .model_for_table(table)
            .ok_or_else(|| Error::UnknownEntity(table.to_string()))
    }

    /// Copy one page of `table` from `source`, rows with id above `after`.
    ///
    /// Returns the copied rows' last id and count; `None` when the page
    /// was empty.
    pub fn copy_page(
        &self,
        source: &Bucket,
        table: &str,
        after: &Value,
        limit: usize,
    ) -> Result<Option<(Value, usize)>, Error> {
        let model = self.model(table)?;
        let mut select = Select::new();
        if !after.is_null() {
            select = select.where_field(ID_FIELD).greater_than(after.clone());
        }
        let rows = self.source_driver(source)?.select(table, &select.limit(limit))?;

        let Some(last) = rows.last().and_then(row_id).cloned() else {
            return Ok(None);
        };
        let count = rows.len();
        for row in rows {
            self.target_driver(model, &row)?.upsert(table, row)?;
        }
        tracing::debug!(
            segment = %self.segment.name,
            bucket = source.id,
            table,
            count,
            last = %last,
            "page copied"
        );
        Ok(Some((last, count)))
    }

    /// Replay captured changes into the next version.
    ///
    /// Each batch is acknowledged once applied. Returns the number of
    /// changes replayed.
    pub fn drain(&self) -> Result<usize, Error> {
        let batch = self.db.config().change_batch_size;
        let mut total = 0;
        for source in &self.sources {
            let driver = self.source_driver(source)?;
            loop {
                let changes = driver.get_changes(Some(MIGRATION_LISTENER), batch)?;
                if changes.is_empty() {
                    break;
                }
                for change in &changes {
                    let model = self.model(&change.table)?;
                    let target = self.target_driver(model, &change.data)?;
                    match change.action {
                        Action::Create | Action::Update => {
                            target.upsert(&change.table, change.data.clone())?;
                        }
                        Action::Delete => {
                            if let Some(id) = row_id(&change.data) {
                                target.delete(&change.table, id)?;
                            }
                        }
                    }
                }
                driver.ack_changes(&changes)?;
                total += changes.len();
            }
        }
        if total > 0 {
            tracing::debug!(segment = %self.segment.name, count = total, "migration changes replayed");
        }
        Ok(total)
    }

    /// Changes captured but not yet replayed.
    pub fn pending(&self) -> Result<usize, Error> {
        let mut pending = 0;
        for source in &self.sources {
            pending += self
                .source_driver(source)?
                .get_changes(Some(MIGRATION_LISTENER), usize::MAX)?
                .len();
        }
        Ok(pending)
    }

    /// Promote the next version and retire the current one.
    ///
    /// The flip happens first so new writes route to the next version.
    /// Writes that reached a source before the flip are still captured and
    /// replayed: one drain while `migration` is tracked, one after removing
    /// the listener. Returns the promoted topology and the changes replayed.
    pub fn finalize(&self) -> Result<(Topology, usize), Error> {
        let core = self.db.core();
        let next = self.next.mark(core.as_ref(), TopologyStatus::Ready)?;
        self.current.mark(core.as_ref(), TopologyStatus::Stale)?;

        let mut replayed = self.drain()?;
        for source in &self.sources {
            let driver = self.source_driver(source)?;
            for table in self.segment.tables() {
                driver.untrack(MIGRATION_LISTENER, &table)?;
            }
        }
        replayed += self.drain()?;

        tracing::info!(
            segment = %self.segment.name,
            from = self.current.version,
            to = next.version,
            replayed,
            "migration finalised"
        );
        Ok((next, replayed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::registry::{EntityRef, Registry};
    use crate::row;
    use crate::topology::Configure;

    fn populated() -> Database {
        let mut registry = Registry::new();
        registry
            .register(Segment::new("app", "events").with_model(Model::new("Event")))
            .unwrap();
        let db = Database::open(DatabaseConfig::default(), registry).unwrap();
        for i in 0..4 {
            db.register_storage("memory", &format!("e{}", i), 1).unwrap();
        }
        let events = EntityRef::class("Event");
        for id in 1..=3i64 {
            db.create(&events, row! { "id" => id }).unwrap();
        }
        db.run(&Configure::new("events").shards(2)).unwrap();
        db
    }

    #[test]
    fn test_write_before_flip_is_replayed() {
        let db = populated();
        let plan = Plan::prepare(&db, "events").unwrap();
        let table = plan.segment.tables().remove(0);
        let source = plan.sources[0].clone();

        let copied = plan.copy_page(&source, &table, &Value::Null, 10).unwrap();
        assert_eq!(copied.map(|(_, count)| count), Some(3));
        plan.drain().unwrap();
        assert_eq!(plan.pending().unwrap(), 0);

        // lands on the still-ready current version
        let events = EntityRef::class("Event");
        db.create(&events, row! { "id" => 4 }).unwrap();

        let (next, replayed) = plan.finalize().unwrap();
        assert_eq!(next.status, TopologyStatus::Ready);
        assert_eq!(replayed, 1);

        let ids: Vec<i64> = db
            .find(&events, &Row::new())
            .unwrap()
            .iter()
            .filter_map(|r| r["id"].as_i64())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        let old = plan.source_driver(&source).unwrap();
        assert!(old.get_changes(Some(MIGRATION_LISTENER), 10).unwrap().is_empty());
        assert!(old
            .subscriptions()
            .unwrap()
            .iter()
            .all(|s| s.listener != MIGRATION_LISTENER));
    }

    #[test]
    fn test_write_after_flip_routes_to_next() {
        let db = populated();
        let plan = Plan::prepare(&db, "events").unwrap();
        let table = plan.segment.tables().remove(0);
        let source = plan.sources[0].clone();
        plan.copy_page(&source, &table, &Value::Null, 10).unwrap();
        plan.finalize().unwrap();

        let events = EntityRef::class("Event");
        db.create(&events, row! { "id" => 5 }).unwrap();
        let old = plan.source_driver(&source).unwrap();
        assert!(old.find_one(&table, &row! { "id" => 5 }).unwrap().is_none());
        assert!(db.find_one(&events, &row! { "id" => 5 }).unwrap().is_some());
    }
}
