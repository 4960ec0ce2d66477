//! Storage driver contract and the shipped drivers.
//!
//! Every storage backend implements [`Driver`]: row CRUD keyed by `id`,
//! cursor selects, additive schema sync, and the change-tracking protocol
//! (`track` / `get_changes` / `ack_changes`) the migration and replication
//! engines are built on.
//!
//! A mutation and the change entries it produces are written in one unit of
//! work, so a listener registered before a read never misses a later write.

mod change;
mod codec;
mod connector;
mod kv;
mod memory;
mod pool;
mod select;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::cmp::Ordering;
use std::thread::{self, ThreadId};

use dashmap::DashMap;

pub use change::{
    changes_for, listeners_for, Action, Change, Subscription, MIGRATION_LISTENER,
    REPLICATION_LISTENER, WILDCARD,
};
pub use codec::{ChangeRecord, FieldValue, RowRecord};
pub use connector::{Connector, DefaultConnector, DriverKind};
pub use kv::SledDriver;
pub use memory::MemoryDriver;
pub use pool::DriverPool;
pub use select::{sort_by_id, Condition, FieldCondition, Select};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDriver;

use crate::error::Error;
use crate::registry::Model;
use crate::value::{row_id, Context, Row, Value, ID_FIELD};

/// Table holding named id sequences on drivers that keep them in a table.
pub const SEQUENCE_TABLE: &str = "sharding_sequence";

/// Table holding change log entries.
pub const CHANGE_TABLE: &str = "sharding_change";

/// Table holding listener subscriptions.
pub const SUBSCRIPTION_TABLE: &str = "sharding_subscription";

/// The capability interface every storage backend implements.
pub trait Driver: Send + Sync {
    /// Backend kind.
    fn kind(&self) -> DriverKind;

    /// Insert a row and return it as stored.
    ///
    /// A missing or null `id` is filled from the driver's sequence for the
    /// table; an explicit integer id advances that sequence past it.
    fn create(&self, table: &str, data: Row) -> Result<Row, Error>;

    /// Rows equal to every field of `filter`, ordered by id.
    fn find(&self, table: &str, filter: &Row) -> Result<Vec<Row>, Error>;

    /// First row matching `filter`, if any.
    fn find_one(&self, table: &str, filter: &Row) -> Result<Option<Row>, Error> {
        Ok(self.find(table, filter)?.into_iter().next())
    }

    /// First row matching `filter`, or [`Error::NotFound`].
    fn find_or_fail(&self, table: &str, filter: &Row) -> Result<Row, Error> {
        self.find_one(table, filter)?.ok_or_else(|| Error::NotFound {
            what: table.to_string(),
        })
    }

    /// First row matching `filter`, creating `filter + data` when absent.
    fn find_or_create(&self, table: &str, filter: &Row, data: Row) -> Result<Row, Error> {
        if let Some(found) = self.find_one(table, filter)? {
            return Ok(found);
        }
        let mut row = filter.clone();
        row.extend(data);
        self.create(table, row)
    }

    /// Merge `data` into the row with `id`. Returns the row after the
    /// update, or `None` when no such row exists.
    fn update(&self, table: &str, id: &Value, data: Row) -> Result<Option<Row>, Error>;

    /// Delete the row with `id`. Returns the deleted row, if any.
    fn delete(&self, table: &str, id: &Value) -> Result<Option<Row>, Error>;

    /// Rows matching a cursor select, ordered by id ascending.
    fn select(&self, table: &str, select: &Select) -> Result<Vec<Row>, Error>;

    /// Update the row carrying `data["id"]`, or create it.
    fn upsert(&self, table: &str, data: Row) -> Result<Row, Error> {
        let id = row_id(&data)
            .cloned()
            .ok_or_else(|| Error::InvalidData(format!("upsert into {} without id", table)))?;
        match self.update(table, &id, data.clone())? {
            Some(row) => Ok(row),
            None => self.create(table, data),
        }
    }

    /// Next value of a named sequence, starting at 1.
    fn next_sequence(&self, name: &str) -> Result<i64, Error>;

    /// Whether the table exists.
    fn has_table(&self, table: &str) -> Result<bool, Error>;

    /// Create the table or add what is missing. Never drops or narrows.
    /// Returns `true` when the table was created by this call.
    fn sync_table(&self, table: &str, model: &Model) -> Result<bool, Error>;

    /// Create the change log and subscription structures if missing.
    fn register_changes(&self) -> Result<(), Error>;

    /// Subscribe `listener` to `table` (or [`WILDCARD`]). Idempotent.
    fn track(&self, listener: &str, table: &str) -> Result<(), Error>;

    /// Remove a subscription. Idempotent.
    fn untrack(&self, listener: &str, table: &str) -> Result<(), Error>;

    /// Every subscription.
    fn subscriptions(&self) -> Result<Vec<Subscription>, Error>;

    /// Pending changes in insertion order, optionally for one listener.
    fn get_changes(&self, listener: Option<&str>, limit: usize) -> Result<Vec<Change>, Error>;

    /// Delete consumed changes. Acknowledging twice is a no-op.
    fn ack_changes(&self, changes: &[Change]) -> Result<(), Error>;

    /// Replace the context snapshotted into change entries made by the
    /// calling thread.
    fn set_context(&self, context: Context);

    /// The calling thread's current context.
    fn context(&self) -> Context;

    /// Approximate bytes held by this storage.
    fn usage(&self) -> Result<u64, Error>;

    /// Drop every table, change and subscription.
    fn reset(&self) -> Result<(), Error>;
}

/// Row id as a map key ordered by [`Value::total_cmp`].
#[derive(Debug, Clone)]
pub struct IdKey(pub Value);

impl PartialEq for IdKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IdKey {}

impl PartialOrd for IdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Mutation context kept per calling thread.
///
/// Drivers are shared through the pool, so a context set by one job never
/// leaks into the changes written by another thread.
#[derive(Debug, Default)]
pub struct ContextSlot {
    by_thread: DashMap<ThreadId, Context>,
}

impl ContextSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the calling thread's context; an empty context clears it.
    pub fn set(&self, context: Context) {
        let thread = thread::current().id();
        if context.is_empty() {
            self.by_thread.remove(&thread);
        } else {
            self.by_thread.insert(thread, context);
        }
    }

    /// The calling thread's context.
    pub fn get(&self) -> Context {
        self.by_thread
            .get(&thread::current().id())
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }
}

/// Split an id-only filter into its id.
pub(crate) fn id_lookup(filter: &Row) -> Option<&Value> {
    if filter.len() == 1 {
        row_id(filter)
    } else {
        None
    }
}

/// Ensure `data` carries an id, drawing from `next` when it does not.
pub(crate) fn assign_id(
    data: &mut Row,
    next: impl FnOnce() -> Result<i64, Error>,
) -> Result<Value, Error> {
    match row_id(data) {
        Some(id) => Ok(id.clone()),
        None => {
            let id = Value::Int(next()?);
            data.insert(ID_FIELD.to_string(), id.clone());
            Ok(id)
        }
    }
}

/// Values of a unique index for a row, `None` when any of them is null.
pub(crate) fn unique_values(row: &Row, fields: &[String]) -> Option<Vec<Value>> {
    fields
        .iter()
        .map(|f| row.get(f).filter(|v| !v.is_null()).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn test_id_key_order() {
        let mut keys = vec![
            IdKey(Value::from("b")),
            IdKey(Value::Int(10)),
            IdKey(Value::Int(2)),
            IdKey(Value::from("a")),
        ];
        keys.sort();
        let ordered: Vec<Value> = keys.into_iter().map(|k| k.0).collect();
        assert_eq!(
            ordered,
            vec![Value::Int(2), Value::Int(10), Value::from("a"), Value::from("b")]
        );
    }

    #[test]
    fn test_unique_values_skip_null() {
        let fields = vec!["name".to_string(), "version".to_string()];
        assert_eq!(
            unique_values(&row! { "name" => "a", "version" => 1 }, &fields),
            Some(vec![Value::from("a"), Value::Int(1)])
        );
        assert_eq!(unique_values(&row! { "name" => "a" }, &fields), None);
    }

    #[test]
    fn test_context_per_thread() {
        let slot = std::sync::Arc::new(ContextSlot::new());
        slot.set(row! { "user" => "alice" });

        let other = slot.clone();
        std::thread::spawn(move || {
            assert!(other.get().is_empty());
            other.set(row! { "user" => "replicator" });
            assert_eq!(other.get()["user"], Value::from("replicator"));
        })
        .join()
        .unwrap();

        assert_eq!(slot.get()["user"], Value::from("alice"));
        slot.set(Context::new());
        assert!(slot.get().is_empty());
    }

    #[test]
    fn test_id_lookup() {
        assert_eq!(id_lookup(&row! { "id" => 3 }), Some(&Value::Int(3)));
        assert_eq!(id_lookup(&row! { "id" => 3, "x" => 1 }), None);
    }
}
