//! Sled-backed document driver.
//!
//! Layout:
//! - one tree per table (`table:{name}`), keyed by the encoded id
//! - `sharding_change`: change log keyed by big-endian LSN
//! - `sharding_subscription`: the subscription list under one key
//! - `sharding_sequence`: named i64 counters and the last LSN
//! - `sharding_schema`: unique index definitions per table (JSON)
//! - `sharding_unique`: `table \0 index \0 values` -> encoded id

use std::collections::HashMap;
use std::ops::Bound;
use std::path::Path;

use dashmap::DashMap;
use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};

use super::change::{changes_for, listeners_for, Action, Change, Subscription};
use super::codec::{ChangeRecord, RowRecord};
use super::connector::DriverKind;
use super::select::{Condition, Select};
use super::{
    assign_id, id_lookup, unique_values, ContextSlot, Driver, CHANGE_TABLE, SEQUENCE_TABLE,
    SUBSCRIPTION_TABLE,
};
use crate::error::Error;
use crate::registry::{IndexDef, Model};
use crate::value::{row_matches, Context, Row, Value, ID_FIELD};

const TABLE_PREFIX: &str = "table:";
const SCHEMA_TREE: &str = "sharding_schema";
const UNIQUE_TREE: &str = "sharding_unique";
const SUBSCRIPTION_KEY: &[u8] = b"subscriptions";
const LSN_KEY: &[u8] = b"\0lsn";

const ID_INT: u8 = 0x01;
const ID_STRING: u8 = 0x02;
const ID_BYTES: u8 = 0x03;

/// Encode an id so that byte order matches id order.
pub fn encode_id(id: &Value) -> Result<Vec<u8>, Error> {
    let mut key = Vec::with_capacity(9);
    match id {
        Value::Int(i) => {
            key.push(ID_INT);
            key.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
        }
        Value::String(s) => {
            key.push(ID_STRING);
            key.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            key.push(ID_BYTES);
            key.extend_from_slice(b);
        }
        other => {
            return Err(Error::InvalidData(format!(
                "unsupported id value: {:?}",
                other
            )))
        }
    }
    Ok(key)
}

fn abort(err: Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(err)
}

fn unique_key(table: &str, index: &IndexDef, values: &[Value]) -> Result<Vec<u8>, Error> {
    let mut key = format!("{}\0{}\0", table, index.name).into_bytes();
    key.extend(serde_json::to_vec(values)?);
    Ok(key)
}

fn read_i64(bytes: &[u8]) -> i64 {
    <[u8; 8]>::try_from(bytes)
        .map(i64::from_be_bytes)
        .unwrap_or(0)
}

fn decode_subscriptions(bytes: Option<&[u8]>) -> Result<Vec<Subscription>, Error> {
    match bytes {
        Some(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| Error::Deserialization(e.to_string())),
        None => Ok(Vec::new()),
    }
}

fn tx_subscriptions(
    subscriptions: &TransactionalTree,
) -> Result<Vec<Subscription>, ConflictableTransactionError<Error>> {
    let current = subscriptions.get(SUBSCRIPTION_KEY)?;
    decode_subscriptions(current.as_deref()).map_err(abort)
}

/// Listeners of `table`, read in the same transaction as the mutation so a
/// concurrent `track` is either seen or ordered after the write.
fn tx_listeners(
    subscriptions: &TransactionalTree,
    table: &str,
) -> Result<Vec<String>, ConflictableTransactionError<Error>> {
    Ok(listeners_for(&tx_subscriptions(subscriptions)?, table))
}

/// Driver storing rows in a sled database.
pub struct SledDriver {
    db: Db,
    tables: DashMap<String, Tree>,
    changes: Tree,
    subscriptions: Tree,
    sequences: Tree,
    schema: Tree,
    unique: Tree,
    unique_defs: RwLock<HashMap<String, Vec<IndexDef>>>,
    context: ContextSlot,
}

impl SledDriver {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// Open a database that is removed when dropped.
    pub fn temporary() -> Result<Self, Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    /// Wrap an already opened database.
    pub fn with_db(db: Db) -> Result<Self, Error> {
        let changes = db.open_tree(CHANGE_TABLE)?;
        let sequences = db.open_tree(SEQUENCE_TABLE)?;
        Self::seed_lsn(&changes, &sequences)?;
        let schema = db.open_tree(SCHEMA_TREE)?;

        let mut unique_defs = HashMap::new();
        for entry in schema.iter() {
            let (table, defs) = entry?;
            let table = String::from_utf8_lossy(&table).into_owned();
            let defs: Vec<IndexDef> = serde_json::from_slice(&defs)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            unique_defs.insert(table, defs);
        }

        Ok(Self {
            subscriptions: db.open_tree(SUBSCRIPTION_TABLE)?,
            sequences,
            unique: db.open_tree(UNIQUE_TREE)?,
            tables: DashMap::new(),
            changes,
            schema,
            db,
            unique_defs: RwLock::new(unique_defs),
            context: ContextSlot::new(),
        })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    /// Record the last logged LSN for logs written before the high-water
    /// mark was kept.
    fn seed_lsn(changes: &Tree, sequences: &Tree) -> Result<(), Error> {
        if sequences.get(LSN_KEY)?.is_some() {
            return Ok(());
        }
        if let Some((key, _)) = changes.last()? {
            if key.len() == 8 {
                sequences.insert(LSN_KEY, key.to_vec())?;
            }
        }
        Ok(())
    }

    fn tree_name(table: &str) -> String {
        format!("{}{}", TABLE_PREFIX, table)
    }

    /// The tree of an existing table, without creating it.
    fn existing_table(&self, table: &str) -> Result<Option<Tree>, Error> {
        if let Some(tree) = self.tables.get(table) {
            return Ok(Some(tree.clone()));
        }
        let name = Self::tree_name(table);
        let exists = self
            .db
            .tree_names()
            .iter()
            .any(|n| &n[..] == name.as_bytes());
        if !exists {
            return Ok(None);
        }
        self.open_table(table).map(Some)
    }

    fn open_table(&self, table: &str) -> Result<Tree, Error> {
        if let Some(tree) = self.tables.get(table) {
            return Ok(tree.clone());
        }
        let tree = self.db.open_tree(Self::tree_name(table))?;
        self.tables.insert(table.to_string(), tree.clone());
        Ok(tree)
    }

    fn defs(&self, table: &str) -> Vec<IndexDef> {
        self.unique_defs
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn observe_sequence(&self, name: &str, id: &Value) -> Result<(), Error> {
        if let Value::Int(id) = id {
            let id = *id;
            self.sequences.fetch_and_update(name.as_bytes(), |old| {
                let current = old.map(read_i64).unwrap_or(0);
                Some(current.max(id).to_be_bytes().to_vec())
            })?;
        }
        Ok(())
    }

    /// Append change entries inside a transaction.
    ///
    /// LSNs continue from the persisted high-water mark, never from the
    /// log contents, so an acknowledged LSN is not handed out again.
    fn append(
        log: &TransactionalTree,
        sequences: &TransactionalTree,
        changes: Vec<Change>,
    ) -> Result<(), ConflictableTransactionError<Error>> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut lsn = sequences
            .get(LSN_KEY)?
            .map(|v| read_i64(&v) as u64)
            .unwrap_or(0);
        for mut change in changes {
            lsn += 1;
            change.id = lsn;
            let bytes = ChangeRecord::encode(&change).map_err(abort)?;
            log.insert(lsn.to_be_bytes().to_vec(), bytes)?;
        }
        sequences.insert(LSN_KEY, lsn.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn unique_entries(
        table: &str,
        defs: &[IndexDef],
        row: &Row,
    ) -> Result<Vec<(Vec<u8>, String)>, Error> {
        let mut entries = Vec::new();
        for index in defs {
            if let Some(values) = unique_values(row, &index.fields) {
                entries.push((unique_key(table, index, &values)?, index.name.clone()));
            }
        }
        Ok(entries)
    }

    fn commit<T>(result: Result<T, TransactionError<Error>>) -> Result<T, Error> {
        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    fn decode_rows(
        iter: impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    ) -> impl Iterator<Item = Result<Row, Error>> {
        iter.map(|entry| {
            let (_, bytes) = entry?;
            RowRecord::decode(&bytes)
        })
    }
}

impl Driver for SledDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sled
    }

    fn create(&self, table: &str, mut data: Row) -> Result<Row, Error> {
        let id = assign_id(&mut data, || self.next_sequence(table))?;
        self.observe_sequence(table, &id)?;

        let key = encode_id(&id)?;
        let bytes = RowRecord::encode(&data)?;
        let tree = self.open_table(table)?;
        let uniques = Self::unique_entries(table, &self.defs(table), &data)?;
        let context = self.context();

        let trees = (&tree, &self.unique, &self.changes, &self.subscriptions, &self.sequences);
        let result = trees.transaction(|(rows, unique, log, subscriptions, sequences)| {
            if rows.get(&key)?.is_some() {
                return Err(abort(Error::UniqueViolation {
                    table: table.to_string(),
                    index: ID_FIELD.to_string(),
                }));
            }
            for (ukey, index) in &uniques {
                if unique.get(ukey)?.is_some() {
                    return Err(abort(Error::UniqueViolation {
                        table: table.to_string(),
                        index: index.clone(),
                    }));
                }
            }
            rows.insert(key.as_slice(), bytes.as_slice())?;
            for (ukey, _) in &uniques {
                unique.insert(ukey.as_slice(), key.as_slice())?;
            }
            let listeners = tx_listeners(subscriptions, table)?;
            Self::append(
                log,
                sequences,
                changes_for(&listeners, table, Action::Create, &data, &context),
            )?;
            Ok(())
        });
        Self::commit(result)?;
        Ok(data)
    }

    fn find(&self, table: &str, filter: &Row) -> Result<Vec<Row>, Error> {
        let Some(tree) = self.existing_table(table)? else {
            return Ok(Vec::new());
        };
        if let Some(id) = id_lookup(filter) {
            return match tree.get(encode_id(id)?)? {
                Some(bytes) => Ok(vec![RowRecord::decode(&bytes)?]),
                None => Ok(Vec::new()),
            };
        }
        let mut rows = Vec::new();
        for row in Self::decode_rows(tree.iter()) {
            let row = row?;
            if row_matches(&row, filter) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn update(&self, table: &str, id: &Value, data: Row) -> Result<Option<Row>, Error> {
        let Some(tree) = self.existing_table(table)? else {
            return Ok(None);
        };
        let key = encode_id(id)?;
        let defs = self.defs(table);
        let context = self.context();

        let trees = (&tree, &self.unique, &self.changes, &self.subscriptions, &self.sequences);
        let result = trees.transaction(|(rows, unique, log, subscriptions, sequences)| {
            let Some(current) = rows.get(&key)? else {
                return Ok(None);
            };
            let previous = RowRecord::decode(&current).map_err(abort)?;
            let mut updated = previous.clone();
            updated.extend(data.clone());
            updated.insert(ID_FIELD.to_string(), id.clone());

            let old = Self::unique_entries(table, &defs, &previous).map_err(abort)?;
            let new = Self::unique_entries(table, &defs, &updated).map_err(abort)?;
            for (ukey, index) in &new {
                if let Some(owner) = unique.get(ukey)? {
                    if owner.as_ref() != key.as_slice() {
                        return Err(abort(Error::UniqueViolation {
                            table: table.to_string(),
                            index: index.clone(),
                        }));
                    }
                }
            }
            for (ukey, _) in &old {
                unique.remove(ukey.as_slice())?;
            }
            for (ukey, _) in &new {
                unique.insert(ukey.as_slice(), key.as_slice())?;
            }

            let bytes = RowRecord::encode(&updated).map_err(abort)?;
            rows.insert(key.as_slice(), bytes)?;
            let listeners = tx_listeners(subscriptions, table)?;
            Self::append(
                log,
                sequences,
                changes_for(&listeners, table, Action::Update, &updated, &context),
            )?;
            Ok(Some(updated))
        });
        Self::commit(result)
    }

    fn delete(&self, table: &str, id: &Value) -> Result<Option<Row>, Error> {
        let Some(tree) = self.existing_table(table)? else {
            return Ok(None);
        };
        let key = encode_id(id)?;
        let defs = self.defs(table);
        let context = self.context();

        let trees = (&tree, &self.unique, &self.changes, &self.subscriptions, &self.sequences);
        let result = trees.transaction(|(rows, unique, log, subscriptions, sequences)| {
            let Some(current) = rows.remove(key.as_slice())? else {
                return Ok(None);
            };
            let previous = RowRecord::decode(&current).map_err(abort)?;
            for (ukey, _) in Self::unique_entries(table, &defs, &previous).map_err(abort)? {
                unique.remove(ukey)?;
            }
            let listeners = tx_listeners(subscriptions, table)?;
            Self::append(
                log,
                sequences,
                changes_for(&listeners, table, Action::Delete, &previous, &context),
            )?;
            Ok(Some(previous))
        });
        Self::commit(result)
    }

    fn select(&self, table: &str, select: &Select) -> Result<Vec<Row>, Error> {
        let Some(tree) = self.existing_table(table)? else {
            return Ok(Vec::new());
        };

        // Start after the cursor when paging by id.
        let start = select.conditions().iter().find_map(|c| match c {
            Condition::GreaterThan(field, value) if field == ID_FIELD => encode_id(value).ok(),
            _ => None,
        });
        let iter = match start {
            Some(key) => tree.range::<Vec<u8>, _>((Bound::Excluded(key), Bound::Unbounded)),
            None => tree.iter(),
        };

        let limit = select.limit_value().unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        for row in Self::decode_rows(iter) {
            if rows.len() >= limit {
                break;
            }
            let row = row?;
            if select.matches(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn next_sequence(&self, name: &str) -> Result<i64, Error> {
        let value = self.sequences.update_and_fetch(name.as_bytes(), |old| {
            let current = old.map(read_i64).unwrap_or(0);
            Some((current + 1).to_be_bytes().to_vec())
        })?;
        Ok(value.map(|v| read_i64(&v)).unwrap_or(1))
    }

    fn has_table(&self, table: &str) -> Result<bool, Error> {
        Ok(self.existing_table(table)?.is_some())
    }

    fn sync_table(&self, table: &str, model: &Model) -> Result<bool, Error> {
        let created = self.existing_table(table)?.is_none();
        let tree = self.open_table(table)?;

        let mut defs = self.defs(table);
        let added: Vec<IndexDef> = model
            .unique_indexes()
            .filter(|index| !defs.iter().any(|d| d.name == index.name))
            .cloned()
            .collect();
        if added.is_empty() {
            return Ok(created);
        }

        // Index rows written before the index existed.
        for row in Self::decode_rows(tree.iter()) {
            let row = row?;
            let Some(id) = row.get(ID_FIELD) else {
                continue;
            };
            let key = encode_id(id)?;
            for (ukey, index) in Self::unique_entries(table, &added, &row)? {
                if self.unique.insert(ukey, key.as_slice())?.is_some() {
                    return Err(Error::UniqueViolation {
                        table: table.to_string(),
                        index,
                    });
                }
            }
        }

        defs.extend(added);
        self.schema.insert(table.as_bytes(), serde_json::to_vec(&defs)?)?;
        self.unique_defs.write().insert(table.to_string(), defs);
        Ok(created)
    }

    fn register_changes(&self) -> Result<(), Error> {
        // Log and subscription trees are opened with the database.
        Ok(())
    }

    fn track(&self, listener: &str, table: &str) -> Result<(), Error> {
        let subscription = Subscription::new(listener, table);
        let added = Self::commit(self.subscriptions.transaction(|subscriptions| {
            let mut all = tx_subscriptions(subscriptions)?;
            if all.contains(&subscription) {
                return Ok(false);
            }
            all.push(subscription.clone());
            all.sort();
            let bytes = serde_json::to_vec(&all).map_err(|e| abort(e.into()))?;
            subscriptions.insert(SUBSCRIPTION_KEY, bytes)?;
            Ok(true)
        }))?;
        if added {
            tracing::debug!(listener, table, "tracking");
        }
        Ok(())
    }

    fn untrack(&self, listener: &str, table: &str) -> Result<(), Error> {
        let subscription = Subscription::new(listener, table);
        Self::commit(self.subscriptions.transaction(|subscriptions| {
            let mut all = tx_subscriptions(subscriptions)?;
            all.retain(|s| *s != subscription);
            let bytes = serde_json::to_vec(&all).map_err(|e| abort(e.into()))?;
            subscriptions.insert(SUBSCRIPTION_KEY, bytes)?;
            Ok(())
        }))
    }

    fn subscriptions(&self) -> Result<Vec<Subscription>, Error> {
        let current = self.subscriptions.get(SUBSCRIPTION_KEY)?;
        decode_subscriptions(current.as_deref())
    }

    fn get_changes(&self, listener: Option<&str>, limit: usize) -> Result<Vec<Change>, Error> {
        let mut changes = Vec::new();
        for entry in self.changes.iter() {
            if changes.len() >= limit {
                break;
            }
            let (_, bytes) = entry?;
            let change = ChangeRecord::decode(&bytes)?;
            if listener.map_or(true, |l| change.listener == l) {
                changes.push(change);
            }
        }
        Ok(changes)
    }

    fn ack_changes(&self, changes: &[Change]) -> Result<(), Error> {
        let mut batch = sled::Batch::default();
        for change in changes {
            batch.remove(change.id.to_be_bytes().to_vec());
        }
        self.changes.apply_batch(batch)?;
        Ok(())
    }

    fn set_context(&self, context: Context) {
        self.context.set(context);
    }

    fn context(&self) -> Context {
        self.context.get()
    }

    fn usage(&self) -> Result<u64, Error> {
        Ok(self.db.size_on_disk()?)
    }

    fn reset(&self) -> Result<(), Error> {
        for name in self.db.tree_names() {
            if name.starts_with(TABLE_PREFIX.as_bytes()) {
                self.db.drop_tree(&name)?;
            }
        }
        self.tables.clear();
        let lsn = self.sequences.get(LSN_KEY)?;
        for tree in [
            &self.changes,
            &self.subscriptions,
            &self.sequences,
            &self.schema,
            &self.unique,
        ] {
            tree.clear()?;
        }
        if let Some(lsn) = lsn {
            self.sequences.insert(LSN_KEY, lsn)?;
        }
        self.unique_defs.write().clear();
        Ok(())
    }
}
