//! The `Replicate` job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use super::applier::Applier;
use super::targets::Targets;
use crate::database::Database;
use crate::driver::REPLICATION_LISTENER;
use crate::error::Error;
use crate::job::Job;

/// Drain the replication log of one storage into replica buckets.
///
/// Polls until the stop flag is raised, `limit` changes were processed,
/// or, with [`Replicate::until_idle`], a poll comes back empty. The stop
/// flag is read before every poll, so a raised flag ends the run after the
/// batch in flight is acknowledged.
#[derive(Debug, Clone)]
pub struct Replicate {
    /// Storage whose change log is drained.
    pub storage: u64,
    /// Wait after an empty poll; the database default when `None`.
    pub delay: Option<Duration>,
    /// Stop after this many changes.
    pub limit: Option<usize>,
    /// Exit on the first empty poll instead of waiting for more changes.
    pub until_idle: bool,
    stop: Arc<AtomicBool>,
}

/// Outcome of a [`Replicate`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicateResult {
    /// Drained storage.
    pub storage: u64,
    /// Changes read and acknowledged.
    pub processed: usize,
    /// Change applications, one per destination.
    pub applied: u64,
}

impl Replicate {
    /// Replicate from `storage`.
    pub fn new(storage: u64) -> Self {
        Self {
            storage,
            delay: None,
            limit: None,
            until_idle: false,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the empty-poll delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Stop after `limit` changes.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Exit once the log is empty.
    pub fn until_idle(mut self) -> Self {
        self.until_idle = true;
        self
    }

    /// Share an externally owned stop flag.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// The stop flag. Raising it ends the run before the next poll.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

impl Job for Replicate {
    type Output = ReplicateResult;

    fn run(&self, db: &Database) -> Result<ReplicateResult, Error> {
        let targets = Targets::build(db, self.storage)?;
        let source = db.pool().get(self.storage)?;
        let delay = self.delay.unwrap_or(db.config().replication_delay);
        let batch = db.config().change_batch_size;
        let applier = Applier::new();
        let mut processed = 0;

        tracing::info!(storage = self.storage, tables = ?targets.tables(), "replication started");
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let wanted = match self.limit {
                Some(limit) if processed >= limit => break,
                Some(limit) => batch.min(limit - processed),
                None => batch,
            };
            let changes = source.get_changes(Some(REPLICATION_LISTENER), wanted)?;
            if changes.is_empty() {
                if self.until_idle {
                    break;
                }
                thread::sleep(delay);
                continue;
            }

            for change in &changes {
                let destinations = targets
                    .get(&change.table)
                    .ok_or_else(|| Error::UnknownReplicationTarget(change.table.clone()))?;
                for target in destinations {
                    applier.apply(target.driver.as_ref(), change)?;
                }
            }
            source.ack_changes(&changes)?;
            processed += changes.len();
            tracing::debug!(storage = self.storage, count = changes.len(), "changes replicated");
        }

        tracing::info!(storage = self.storage, processed, applied = applier.applied(), "replication stopped");
        Ok(ReplicateResult {
            storage: self.storage,
            processed,
            applied: applier.applied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::registry::{EntityRef, Model, Registry, Segment};
    use crate::row;
    use crate::topology::Configure;
    use crate::value::{Row, Value};

    fn replicated() -> (Database, u64, u64) {
        let mut registry = Registry::new();
        registry
            .register(Segment::new("app", "notes").with_model(Model::new("Note")))
            .unwrap();
        let db = Database::open(DatabaseConfig::default(), registry).unwrap();
        db.register_storage("memory", "primary", 1).unwrap();
        db.register_storage("memory", "replica", 1).unwrap();
        db.run(&Configure::new("notes").replicas(1)).unwrap();

        let notes = EntityRef::class("Note");
        db.create(&notes, row! { "text" => "a" }).unwrap();
        let buckets = db.locator().buckets("notes").unwrap();
        (db, buckets[0].storage, buckets[1].storage)
    }

    fn stopped(storage: u64) -> Replicate {
        Replicate::new(storage).until_idle()
    }

    #[test]
    fn test_replica_receives_changes() {
        let (db, primary, replica) = replicated();
        let notes = EntityRef::class("Note");
        let second = db.create(&notes, row! { "text" => "b" }).unwrap();
        db.update(&notes, &second["id"], row! { "text" => "B" }).unwrap();
        db.delete(&notes, &Value::Int(1)).unwrap();

        let result = db.run(&stopped(primary)).unwrap();
        assert_eq!(result.processed, 4);
        assert_eq!(result.applied, 4);

        let replica = db.pool().get(replica).unwrap();
        let rows = replica.find("app_notes_note", &Row::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["text"], Value::from("B"));

        // everything acknowledged
        let again = db.run(&stopped(primary)).unwrap();
        assert_eq!(again.processed, 0);
    }

    #[test]
    fn test_limit_bounds_run() {
        let (db, primary, _) = replicated();
        let notes = EntityRef::class("Note");
        for text in ["b", "c", "d"] {
            db.create(&notes, row! { "text" => text }).unwrap();
        }
        let job = Replicate::new(primary).limit(2);
        assert_eq!(db.run(&job).unwrap().processed, 2);
        assert_eq!(db.run(&stopped(primary)).unwrap().processed, 2);
    }

    #[test]
    fn test_stop_checked_before_every_poll() {
        let mut registry = Registry::new();
        registry
            .register(Segment::new("app", "notes").with_model(Model::new("Note")))
            .unwrap();
        let config = DatabaseConfig::default().with_change_batch_size(2);
        let db = Database::open(config, registry).unwrap();
        db.register_storage("memory", "stop-primary", 1).unwrap();
        db.register_storage("memory", "stop-replica", 1).unwrap();
        db.run(&Configure::new("notes").replicas(1)).unwrap();
        let notes = EntityRef::class("Note");
        for i in 0..6i64 {
            db.create(&notes, row! { "n" => i }).unwrap();
        }
        let primary = db.locator().buckets("notes").unwrap()[0].storage;

        let job = stopped(primary);
        job.stop_handle().store(true, Ordering::SeqCst);
        assert_eq!(db.run(&job).unwrap().processed, 0);

        let source = db.pool().get(primary).unwrap();
        assert_eq!(source.get_changes(Some(REPLICATION_LISTENER), 100).unwrap().len(), 6);
        assert_eq!(db.run(&stopped(primary)).unwrap().processed, 6);
    }

    #[test]
    fn test_stop_raised_while_waiting() {
        let (db, primary, _) = replicated();
        let job = Replicate::new(primary).delay(Duration::from_millis(5));
        let stop = job.stop_handle();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stop.store(true, Ordering::SeqCst);
        });
        assert_eq!(db.run(&job).unwrap().processed, 1);
        raiser.join().unwrap();
    }

    #[test]
    fn test_unknown_target() {
        let (db, primary, _) = replicated();
        let source = db.pool().get(primary).unwrap();
        source.create("app_other_thing", row! { "id" => 1 }).unwrap();
        source.track(REPLICATION_LISTENER, "app_other_thing").unwrap();
        source.create("app_other_thing", row! { "id" => 2 }).unwrap();

        db.run(&stopped(primary)).unwrap_err();
        // the failed batch stays in the log
        let err = db.run(&stopped(primary)).unwrap_err();
        assert!(matches!(err, Error::UnknownReplicationTarget(table) if table == "app_other_thing"));
    }
}
