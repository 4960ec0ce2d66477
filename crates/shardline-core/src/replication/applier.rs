//! Idempotent application of one change to one replica.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::driver::{Action, Change, Driver};
use crate::error::Error;
use crate::value::{row_id, Row, ID_FIELD};

/// Applies changes and counts them.
#[derive(Debug, Default)]
pub struct Applier {
    applied: AtomicU64,
}

impl Applier {
    /// Create an applier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `change` to `target`.
    ///
    /// A replayed create finds the existing row; an update of a missing
    /// row creates it; deleting a missing row does nothing.
    pub fn apply(&self, target: &dyn Driver, change: &Change) -> Result<(), Error> {
        let id = row_id(&change.data).cloned().ok_or_else(|| {
            Error::InvalidData(format!("change {} on {} has no id", change.id, change.table))
        })?;
        target.set_context(change.context.clone());

        match change.action {
            Action::Create => {
                let mut filter = Row::new();
                filter.insert(ID_FIELD.to_string(), id);
                target.find_or_create(&change.table, &filter, change.data.clone())?;
            }
            Action::Update => {
                if target.update(&change.table, &id, change.data.clone())?.is_none() {
                    target.create(&change.table, change.data.clone())?;
                }
            }
            Action::Delete => {
                target.delete(&change.table, &id)?;
            }
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Changes applied so far.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::driver::MemoryDriver;
    use crate::row;
    use crate::value::Value;

    fn change(action: Action, data: Row) -> Change {
        Change {
            id: 1,
            table: "app_activity_activity".to_string(),
            action,
            data,
            context: row! { "user" => "bob" },
            listener: "replication".to_string(),
        }
    }

    #[test]
    fn test_replay_is_idempotent() {
        let replica = MemoryDriver::new("replica");
        let applier = Applier::new();
        let create = change(Action::Create, row! { "id" => 1, "kind" => "login" });
        applier.apply(&replica, &create).unwrap();
        applier.apply(&replica, &create).unwrap();
        assert_eq!(replica.find("app_activity_activity", &Row::new()).unwrap().len(), 1);

        let update = change(Action::Update, row! { "id" => 2, "kind" => "view" });
        applier.apply(&replica, &update).unwrap();
        assert!(replica
            .find_one("app_activity_activity", &row! { "id" => 2 })
            .unwrap()
            .is_some());

        let delete = change(Action::Delete, row! { "id" => 1 });
        applier.apply(&replica, &delete).unwrap();
        applier.apply(&replica, &delete).unwrap();
        assert_eq!(replica.find("app_activity_activity", &Row::new()).unwrap().len(), 1);
        assert_eq!(applier.applied(), 5);
    }

    #[test]
    fn test_change_without_id() {
        let replica = MemoryDriver::new("replica");
        let err = Applier::new()
            .apply(&replica, &change(Action::Create, row! { "kind" => "login" }))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn test_replica_context_stays_on_its_thread() {
        let driver = Arc::new(MemoryDriver::new("shared"));
        driver.track("audit", "*").unwrap();
        driver.set_context(row! { "user" => "alice" });

        let replica = driver.clone();
        std::thread::spawn(move || {
            let create = change(Action::Create, row! { "id" => 1 });
            Applier::new().apply(replica.as_ref(), &create).unwrap();
        })
        .join()
        .unwrap();
        driver.create("app_activity_activity", row! { "id" => 2 }).unwrap();

        let changes = driver.get_changes(Some("audit"), 10).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].context["user"], Value::from("bob"));
        assert_eq!(changes[1].context["user"], Value::from("alice"));
    }
}
