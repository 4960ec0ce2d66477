//! In-memory driver.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use super::change::{changes_for, listeners_for, Action, Change, Subscription};
use super::connector::DriverKind;
use super::select::Select;
use super::{assign_id, id_lookup, unique_values, ContextSlot, Driver, IdKey};
use crate::error::Error;
use crate::registry::{IndexDef, Model};
use crate::value::{row_matches, row_size, Context, Row, Value, ID_FIELD};

#[derive(Debug, Default)]
struct MemoryTable {
    rows: BTreeMap<IdKey, Row>,
    unique: Vec<IndexDef>,
}

impl MemoryTable {
    fn check_unique(&self, table: &str, row: &Row, id: &Value) -> Result<(), Error> {
        for index in &self.unique {
            let Some(values) = unique_values(row, &index.fields) else {
                continue;
            };
            let taken = self.rows.iter().any(|(key, other)| {
                key.0.total_cmp(id).is_ne()
                    && unique_values(other, &index.fields).as_ref() == Some(&values)
            });
            if taken {
                return Err(Error::UniqueViolation {
                    table: table.to_string(),
                    index: index.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    /// `None` until `register_changes` (or the first `track`).
    changes: Option<BTreeMap<u64, Change>>,
    subscriptions: BTreeSet<Subscription>,
    last_lsn: u64,
    sequences: HashMap<String, i64>,
}

impl MemoryState {
    fn next_sequence(&mut self, name: &str) -> i64 {
        let seq = self.sequences.entry(name.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn observe_sequence(&mut self, name: &str, id: &Value) {
        if let Value::Int(id) = id {
            let seq = self.sequences.entry(name.to_string()).or_insert(0);
            *seq = (*seq).max(*id);
        }
    }

    fn record(&mut self, table: &str, action: Action, data: &Row, context: &Context) {
        let Some(log) = self.changes.as_mut() else {
            return;
        };
        let listeners = listeners_for(&self.subscriptions, table);
        for mut change in changes_for(&listeners, table, action, data, context) {
            self.last_lsn += 1;
            change.id = self.last_lsn;
            log.insert(change.id, change);
        }
    }
}

/// Driver keeping every table in process memory.
///
/// State sits behind one `RwLock`; a mutation and its change entries are
/// applied under the same write guard.
#[derive(Debug)]
pub struct MemoryDriver {
    name: String,
    state: RwLock<MemoryState>,
    context: ContextSlot,
}

impl MemoryDriver {
    /// Create an empty driver.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
            context: ContextSlot::new(),
        }
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new("default")
    }
}

impl Driver for MemoryDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    fn create(&self, table: &str, mut data: Row) -> Result<Row, Error> {
        let context = self.context();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let id = assign_id(&mut data, || Ok(state.next_sequence(table)))?;
        state.observe_sequence(table, &id);

        let entry = state.tables.entry(table.to_string()).or_default();
        let key = IdKey(id.clone());
        if entry.rows.contains_key(&key) {
            return Err(Error::UniqueViolation {
                table: table.to_string(),
                index: ID_FIELD.to_string(),
            });
        }
        entry.check_unique(table, &data, &id)?;
        entry.rows.insert(key, data.clone());

        state.record(table, Action::Create, &data, &context);
        Ok(data)
    }

    fn find(&self, table: &str, filter: &Row) -> Result<Vec<Row>, Error> {
        let state = self.state.read();
        let Some(entry) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        if let Some(id) = id_lookup(filter) {
            return Ok(entry.rows.get(&IdKey(id.clone())).cloned().into_iter().collect());
        }
        Ok(entry
            .rows
            .values()
            .filter(|row| row_matches(row, filter))
            .cloned()
            .collect())
    }

    fn update(&self, table: &str, id: &Value, data: Row) -> Result<Option<Row>, Error> {
        let context = self.context();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(entry) = state.tables.get_mut(table) else {
            return Ok(None);
        };
        let key = IdKey(id.clone());
        let Some(existing) = entry.rows.get(&key) else {
            return Ok(None);
        };
        let mut updated = existing.clone();
        updated.extend(data);
        updated.insert(ID_FIELD.to_string(), id.clone());
        entry.check_unique(table, &updated, id)?;
        entry.rows.insert(key, updated.clone());

        state.record(table, Action::Update, &updated, &context);
        Ok(Some(updated))
    }

    fn delete(&self, table: &str, id: &Value) -> Result<Option<Row>, Error> {
        let context = self.context();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let removed = state
            .tables
            .get_mut(table)
            .and_then(|entry| entry.rows.remove(&IdKey(id.clone())));
        if let Some(row) = &removed {
            state.record(table, Action::Delete, row, &context);
        }
        Ok(removed)
    }

    fn select(&self, table: &str, select: &Select) -> Result<Vec<Row>, Error> {
        let state = self.state.read();
        let Some(entry) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        let rows = entry.rows.values().filter(|row| select.matches(row));
        Ok(match select.limit_value() {
            Some(limit) => rows.take(limit).cloned().collect(),
            None => rows.cloned().collect(),
        })
    }

    fn next_sequence(&self, name: &str) -> Result<i64, Error> {
        Ok(self.state.write().next_sequence(name))
    }

    fn has_table(&self, table: &str) -> Result<bool, Error> {
        Ok(self.state.read().tables.contains_key(table))
    }

    fn sync_table(&self, table: &str, model: &Model) -> Result<bool, Error> {
        let mut state = self.state.write();
        let created = !state.tables.contains_key(table);
        let entry = state.tables.entry(table.to_string()).or_default();
        for index in model.unique_indexes() {
            if !entry.unique.iter().any(|i| i.name == index.name) {
                entry.unique.push(index.clone());
            }
        }
        Ok(created)
    }

    fn register_changes(&self) -> Result<(), Error> {
        let mut state = self.state.write();
        if state.changes.is_none() {
            state.changes = Some(BTreeMap::new());
        }
        Ok(())
    }

    fn track(&self, listener: &str, table: &str) -> Result<(), Error> {
        self.register_changes()?;
        let inserted = self
            .state
            .write()
            .subscriptions
            .insert(Subscription::new(listener, table));
        if inserted {
            tracing::debug!(driver = %self.name, listener, table, "tracking");
        }
        Ok(())
    }

    fn untrack(&self, listener: &str, table: &str) -> Result<(), Error> {
        self.state
            .write()
            .subscriptions
            .remove(&Subscription::new(listener, table));
        Ok(())
    }

    fn subscriptions(&self) -> Result<Vec<Subscription>, Error> {
        Ok(self.state.read().subscriptions.iter().cloned().collect())
    }

    fn get_changes(&self, listener: Option<&str>, limit: usize) -> Result<Vec<Change>, Error> {
        let state = self.state.read();
        let Some(log) = state.changes.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(log
            .values()
            .filter(|c| listener.map_or(true, |l| c.listener == l))
            .take(limit)
            .cloned()
            .collect())
    }

    fn ack_changes(&self, changes: &[Change]) -> Result<(), Error> {
        let mut state = self.state.write();
        if let Some(log) = state.changes.as_mut() {
            for change in changes {
                log.remove(&change.id);
            }
        }
        Ok(())
    }

    fn set_context(&self, context: Context) {
        self.context.set(context);
    }

    fn context(&self) -> Context {
        self.context.get()
    }

    fn usage(&self) -> Result<u64, Error> {
        let state = self.state.read();
        let rows: usize = state
            .tables
            .values()
            .flat_map(|t| t.rows.values())
            .map(row_size)
            .sum();
        let changes: usize = state
            .changes
            .iter()
            .flat_map(|log| log.values())
            .map(|c| row_size(&c.data) + c.table.len() + c.listener.len())
            .sum();
        Ok((rows + changes) as u64)
    }

    fn reset(&self) -> Result<(), Error> {
        *self.state.write() = MemoryState::default();
        Ok(())
    }
}
