//! SQLite-backed relational driver.
//!
//! Tables are real SQL tables with one column per field. Columns are added,
//! never dropped, when a model grows or a write carries a new field. Booleans
//! are stored as integers and restored from the declared field types.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};

use super::change::{changes_for, listeners_for, Action, Change, Subscription};
use super::connector::DriverKind;
use super::select::{Condition, Select};
use super::{
    assign_id, ContextSlot, Driver, CHANGE_TABLE, SEQUENCE_TABLE, SUBSCRIPTION_TABLE,
};
use crate::error::Error;
use crate::registry::{FieldType, IndexDef, Model};
use crate::value::{row_id, Context, Row, Value, ID_FIELD};

const SCHEMA_TABLE: &str = "sharding_schema";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_type(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Int | FieldType::Bool => "INTEGER",
        FieldType::Float => "REAL",
        FieldType::String => "TEXT",
        FieldType::Bytes => "BLOB",
    }
}

fn id_column(id: Option<&Value>, declared: Option<FieldType>) -> String {
    let ty = match (declared, id) {
        (Some(ty), _) => column_type(ty),
        (None, Some(Value::String(_))) => "TEXT",
        (None, Some(Value::Bytes(_))) => "BLOB",
        (None, _) => "INTEGER",
    };
    format!("{} {} PRIMARY KEY", quote(ID_FIELD), ty)
}

/// Connection plus the schema knowledge derived from it.
struct SqliteState {
    conn: Connection,
    /// Known columns per table.
    columns: HashMap<String, BTreeSet<String>>,
    /// Declared field types per table.
    types: HashMap<String, HashMap<String, FieldType>>,
    /// Declared unique indexes per table.
    unique: HashMap<String, Vec<IndexDef>>,
    changes: bool,
}

impl SqliteState {
    fn load_columns(&mut self, table: &str) -> Result<Option<&BTreeSet<String>>, Error> {
        if !self.columns.contains_key(table) {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            drop(stmt);
            if names.is_empty() {
                return Ok(None);
            }
            self.columns.insert(table.to_string(), names);
        }
        Ok(self.columns.get(table))
    }

    fn load_types(&mut self, table: &str) -> Result<(), Error> {
        if self.types.contains_key(table) {
            return Ok(());
        }
        let fields: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT fields FROM {} WHERE tbl = ?1", SCHEMA_TABLE),
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        let types = match fields {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| Error::Deserialization(e.to_string()))?,
            None => HashMap::new(),
        };
        self.types.insert(table.to_string(), types);
        Ok(())
    }

    /// Create the table or add the columns `row` needs.
    fn ensure_table(&mut self, table: &str, row: &Row) -> Result<(), Error> {
        let existing = self.load_columns(table)?.cloned();
        let existing = match existing {
            Some(columns) => columns,
            None => {
                self.conn.execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {} ({})",
                        quote(table),
                        id_column(row_id(row), None)
                    ),
                    [],
                )?;
                let columns: BTreeSet<String> = [ID_FIELD.to_string()].into();
                self.columns.insert(table.to_string(), columns.clone());
                columns
            }
        };
        for field in row.keys().filter(|f| !existing.contains(*f)) {
            self.conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {}", quote(table), quote(field)),
                [],
            )?;
            if let Some(columns) = self.columns.get_mut(table) {
                columns.insert(field.clone());
            }
        }
        Ok(())
    }

    fn query(&mut self, table: &str, sql: &str, values: &[&Value]) -> Result<Vec<Row>, Error> {
        self.load_types(table)?;
        let bools: HashSet<&str> = self
            .types
            .get(table)
            .into_iter()
            .flatten()
            .filter(|(_, ty)| **ty == FieldType::Bool)
            .map(|(name, _)| name.as_str())
            .collect();

        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let mut row = Row::new();
            for (i, name) in names.iter().enumerate() {
                let value = match r.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) if bools.contains(name.as_str()) => Value::Bool(v != 0),
                    ValueRef::Integer(v) => Value::Int(v),
                    ValueRef::Real(v) => Value::Float(v),
                    ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
                };
                row.insert(name.clone(), value);
            }
            out.push(row);
        }
        Ok(out)
    }

    fn get(&mut self, table: &str, id: &Value) -> Result<Option<Row>, Error> {
        if self.load_columns(table)?.is_none() {
            return Ok(None);
        }
        let sql = format!("SELECT * FROM {} WHERE {} IS ?1", quote(table), quote(ID_FIELD));
        Ok(self.query(table, &sql, &[id])?.into_iter().next())
    }

    fn next_sequence(&self, name: &str) -> Result<i64, Error> {
        Ok(self.conn.query_row(
            &format!(
                "INSERT INTO {} (name, value) VALUES (?1, 1) \
                 ON CONFLICT(name) DO UPDATE SET value = value + 1 RETURNING value",
                SEQUENCE_TABLE
            ),
            params![name],
            |row| row.get(0),
        )?)
    }

    fn observe_sequence(&self, name: &str, id: &Value) -> Result<(), Error> {
        if let Value::Int(id) = id {
            self.conn.execute(
                &format!(
                    "INSERT INTO {} (name, value) VALUES (?1, ?2) \
                     ON CONFLICT(name) DO UPDATE SET value = max(value, excluded.value)",
                    SEQUENCE_TABLE
                ),
                params![name, id],
            )?;
        }
        Ok(())
    }

    fn subscriptions(&self) -> Result<Vec<Subscription>, Error> {
        if !self.changes {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT listener, tbl FROM {} ORDER BY listener, tbl",
            SUBSCRIPTION_TABLE
        ))?;
        let subscriptions = stmt
            .query_map([], |row| {
                Ok(Subscription::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subscriptions)
    }

    fn record(&self, table: &str, action: Action, data: &Row, context: &Context) -> Result<(), Error> {
        if !self.changes {
            return Ok(());
        }
        let listeners = listeners_for(&self.subscriptions()?, table);
        let data = serde_json::to_string(data)?;
        let context = serde_json::to_string(context)?;
        for listener in listeners {
            self.conn.execute(
                &format!(
                    "INSERT INTO {} (tbl, action, data, context, listener) VALUES (?1, ?2, ?3, ?4, ?5)",
                    CHANGE_TABLE
                ),
                params![table, action.as_str(), data, context, listener],
            )?;
        }
        Ok(())
    }

    fn register_changes(&mut self) -> Result<(), Error> {
        if self.changes {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tbl TEXT NOT NULL,
                action TEXT NOT NULL,
                data TEXT NOT NULL,
                context TEXT NOT NULL,
                listener TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {}_listener ON {} (listener, id);
            CREATE TABLE IF NOT EXISTS {} (
                listener TEXT NOT NULL,
                tbl TEXT NOT NULL,
                PRIMARY KEY (listener, tbl)
            );",
            CHANGE_TABLE, CHANGE_TABLE, CHANGE_TABLE, SUBSCRIPTION_TABLE
        ))?;
        self.changes = true;
        Ok(())
    }

    /// Run `f` inside `BEGIN` / `COMMIT`, rolling back when it fails.
    fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.conn.execute_batch("BEGIN")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                // columns added inside the transaction are gone again
                self.columns.clear();
                Err(err)
            }
        }
    }

    /// Translate constraint failures into [`Error::UniqueViolation`].
    fn constraint(&self, table: &str, err: rusqlite::Error) -> Error {
        let rusqlite::Error::SqliteFailure(failure, message) = &err else {
            return Error::Sqlite(err);
        };
        if failure.code != rusqlite::ErrorCode::ConstraintViolation {
            return Error::Sqlite(err);
        }
        // "UNIQUE constraint failed: table.a, table.b"
        let detail = message.as_deref().unwrap_or_default();
        let columns: Vec<String> = detail
            .rsplit(": ")
            .next()
            .unwrap_or(detail)
            .split(", ")
            .map(|c| c.rsplit('.').next().unwrap_or(c).to_string())
            .collect();
        let index = self
            .unique
            .get(table)
            .and_then(|defs| defs.iter().find(|d| d.fields == columns))
            .map(|d| d.name.clone())
            .unwrap_or_else(|| columns.join(","));
        Error::UniqueViolation {
            table: table.to_string(),
            index,
        }
    }
}

/// Driver storing rows in a SQLite database.
pub struct SqliteDriver {
    state: Mutex<SqliteState>,
    context: ContextSlot,
}

impl SqliteDriver {
    /// Open a database file, or an in-memory database for `:memory:`.
    pub fn open(dsn: &str) -> Result<Self, Error> {
        let conn = if dsn == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(dsn)?
        };
        Self::with_connection(conn)
    }

    /// Wrap an open connection.
    pub fn with_connection(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY, value INTEGER NOT NULL);
             CREATE TABLE IF NOT EXISTS {} (tbl TEXT PRIMARY KEY, fields TEXT NOT NULL);",
            SEQUENCE_TABLE, SCHEMA_TABLE
        ))?;
        let changes = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![CHANGE_TABLE],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        Ok(Self {
            state: Mutex::new(SqliteState {
                conn,
                columns: HashMap::new(),
                types: HashMap::new(),
                unique: HashMap::new(),
                changes,
            }),
            context: ContextSlot::new(),
        })
    }
}

impl Driver for SqliteDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    fn create(&self, table: &str, mut data: Row) -> Result<Row, Error> {
        let context = self.context();
        self.state.lock().transaction(|state| {
            let id = assign_id(&mut data, || state.next_sequence(table))?;
            state.observe_sequence(table, &id)?;
            state.ensure_table(table, &data)?;

            let columns: Vec<String> = data.keys().map(|k| quote(k)).collect();
            let placeholders: Vec<String> = (1..=data.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                columns.join(", "),
                placeholders.join(", ")
            );
            state
                .conn
                .execute(&sql, params_from_iter(data.values()))
                .map_err(|e| state.constraint(table, e))?;
            state.record(table, Action::Create, &data, &context)
        })?;
        Ok(data)
    }

    fn find(&self, table: &str, filter: &Row) -> Result<Vec<Row>, Error> {
        let mut state = self.state.lock();
        let Some(columns) = state.load_columns(table)? else {
            return Ok(Vec::new());
        };
        // A filter on a column that does not exist only matches nulls.
        if filter
            .iter()
            .any(|(field, value)| !columns.contains(field) && !value.is_null())
        {
            return Ok(Vec::new());
        }
        let known: Vec<(&String, &Value)> =
            filter.iter().filter(|(f, _)| columns.contains(*f)).collect();

        let mut sql = format!("SELECT * FROM {}", quote(table));
        for (i, (field, _)) in known.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("{} IS ?{}", quote(field), i + 1));
        }
        sql.push_str(&format!(" ORDER BY {}", quote(ID_FIELD)));
        let values: Vec<&Value> = known.iter().map(|(_, v)| *v).collect();
        state.query(table, &sql, &values)
    }

    fn update(&self, table: &str, id: &Value, data: Row) -> Result<Option<Row>, Error> {
        let context = self.context();
        self.state.lock().transaction(|state| {
            let Some(mut updated) = state.get(table, id)? else {
                return Ok(None);
            };
            updated.extend(data);
            updated.insert(ID_FIELD.to_string(), id.clone());
            state.ensure_table(table, &updated)?;

            let assignments: Vec<String> = updated
                .keys()
                .enumerate()
                .map(|(i, k)| format!("{} = ?{}", quote(k), i + 1))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} IS ?{}",
                quote(table),
                assignments.join(", "),
                quote(ID_FIELD),
                updated.len() + 1
            );
            let values = updated.values().chain(std::iter::once(id));
            state
                .conn
                .execute(&sql, params_from_iter(values))
                .map_err(|e| state.constraint(table, e))?;
            state.record(table, Action::Update, &updated, &context)?;
            Ok(Some(updated))
        })
    }

    fn delete(&self, table: &str, id: &Value) -> Result<Option<Row>, Error> {
        let context = self.context();
        self.state.lock().transaction(|state| {
            let Some(previous) = state.get(table, id)? else {
                return Ok(None);
            };
            state.conn.execute(
                &format!("DELETE FROM {} WHERE {} IS ?1", quote(table), quote(ID_FIELD)),
                params![id],
            )?;
            state.record(table, Action::Delete, &previous, &context)?;
            Ok(Some(previous))
        })
    }

    fn select(&self, table: &str, select: &Select) -> Result<Vec<Row>, Error> {
        let mut state = self.state.lock();
        let Some(columns) = state.load_columns(table)? else {
            return Ok(Vec::new());
        };
        let columns = columns.clone();

        let mut clauses = Vec::new();
        let mut values = Vec::new();
        for condition in select.conditions() {
            if !columns.contains(condition.field()) {
                // Only `IS NULL` can match a missing column.
                match condition {
                    Condition::Equals(_, Value::Null) => continue,
                    _ => return Ok(Vec::new()),
                }
            }
            let (op, value) = match condition {
                Condition::Equals(_, v) => ("IS", v),
                Condition::GreaterThan(_, v) => (">", v),
                Condition::LessThan(_, v) => ("<", v),
            };
            values.push(value);
            clauses.push(format!("{} {} ?{}", quote(condition.field()), op, values.len()));
        }

        let mut sql = format!("SELECT * FROM {}", quote(table));
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {} ASC", quote(ID_FIELD)));
        if let Some(limit) = select.limit_value() {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        state.query(table, &sql, &values)
    }

    fn next_sequence(&self, name: &str) -> Result<i64, Error> {
        self.state.lock().next_sequence(name)
    }

    fn has_table(&self, table: &str) -> Result<bool, Error> {
        Ok(self.state.lock().load_columns(table)?.is_some())
    }

    fn sync_table(&self, table: &str, model: &Model) -> Result<bool, Error> {
        let mut state = self.state.lock();
        let created = state.load_columns(table)?.is_none();

        if created {
            let mut columns = vec![id_column(None, Some(model.id_type()))];
            columns.extend(
                model
                    .fields
                    .iter()
                    .filter(|f| f.name != ID_FIELD)
                    .map(|f| format!("{} {}", quote(&f.name), column_type(f.ty))),
            );
            state.conn.execute(
                &format!("CREATE TABLE {} ({})", quote(table), columns.join(", ")),
                [],
            )?;
            tracing::debug!(table, "table created");
        } else {
            let existing = state.load_columns(table)?.cloned().unwrap_or_default();
            for field in model.fields.iter().filter(|f| !existing.contains(&f.name)) {
                state.conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        quote(table),
                        quote(&field.name),
                        column_type(field.ty)
                    ),
                    [],
                )?;
            }
        }
        state.columns.remove(table);

        for index in &model.indexes {
            let columns: Vec<String> = index.fields.iter().map(|f| quote(f)).collect();
            state.conn.execute(
                &format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    quote(&format!("{}__{}", table, index.name)),
                    quote(table),
                    columns.join(", ")
                ),
                [],
            )?;
        }

        state.load_types(table)?;
        let mut types = state.types.remove(table).unwrap_or_default();
        for field in &model.fields {
            types.entry(field.name.clone()).or_insert(field.ty);
        }
        state.conn.execute(
            &format!(
                "INSERT INTO {} (tbl, fields) VALUES (?1, ?2) \
                 ON CONFLICT(tbl) DO UPDATE SET fields = excluded.fields",
                SCHEMA_TABLE
            ),
            params![table, serde_json::to_string(&types)?],
        )?;
        state.types.insert(table.to_string(), types);

        let unique = state.unique.entry(table.to_string()).or_default();
        for index in model.unique_indexes() {
            if !unique.iter().any(|d| d.name == index.name) {
                unique.push(index.clone());
            }
        }
        Ok(created)
    }

    fn register_changes(&self) -> Result<(), Error> {
        self.state.lock().register_changes()
    }

    fn track(&self, listener: &str, table: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.register_changes()?;
        let inserted = state.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (listener, tbl) VALUES (?1, ?2)",
                SUBSCRIPTION_TABLE
            ),
            params![listener, table],
        )?;
        if inserted > 0 {
            tracing::debug!(listener, table, "tracking");
        }
        Ok(())
    }

    fn untrack(&self, listener: &str, table: &str) -> Result<(), Error> {
        let state = self.state.lock();
        if state.changes {
            state.conn.execute(
                &format!(
                    "DELETE FROM {} WHERE listener = ?1 AND tbl = ?2",
                    SUBSCRIPTION_TABLE
                ),
                params![listener, table],
            )?;
        }
        Ok(())
    }

    fn subscriptions(&self) -> Result<Vec<Subscription>, Error> {
        self.state.lock().subscriptions()
    }

    fn get_changes(&self, listener: Option<&str>, limit: usize) -> Result<Vec<Change>, Error> {
        let state = self.state.lock();
        if !state.changes {
            return Ok(Vec::new());
        }
        let mut stmt = state.conn.prepare(&format!(
            "SELECT id, tbl, action, data, context, listener FROM {} \
             WHERE ?1 IS NULL OR listener = ?1 ORDER BY id LIMIT ?2",
            CHANGE_TABLE
        ))?;
        let raw = stmt
            .query_map(params![listener, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, table, action, data, context, listener)| {
                Ok(Change {
                    id: id as u64,
                    table,
                    action: action.parse()?,
                    data: serde_json::from_str(&data)
                        .map_err(|e| Error::Deserialization(e.to_string()))?,
                    context: serde_json::from_str(&context)
                        .map_err(|e| Error::Deserialization(e.to_string()))?,
                    listener,
                })
            })
            .collect()
    }

    fn ack_changes(&self, changes: &[Change]) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.changes || changes.is_empty() {
            return Ok(());
        }
        state.transaction(|state| {
            let mut stmt = state
                .conn
                .prepare(&format!("DELETE FROM {} WHERE id = ?1", CHANGE_TABLE))?;
            for change in changes {
                stmt.execute(params![change.id as i64])?;
            }
            Ok(())
        })
    }

    fn set_context(&self, context: Context) {
        self.context.set(context);
    }

    fn context(&self) -> Context {
        self.context.get()
    }

    fn usage(&self) -> Result<u64, Error> {
        let state = self.state.lock();
        let pages: i64 = state.conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let size: i64 = state.conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((pages * size) as u64)
    }

    fn reset(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        let tables: Vec<String> = {
            let mut stmt = state.conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
            names.collect::<Result<Vec<_>, _>>()?
        };
        for table in tables {
            state
                .conn
                .execute(&format!("DROP TABLE IF EXISTS {}", quote(&table)), [])?;
        }
        state.conn.execute_batch(&format!(
            "CREATE TABLE {} (name TEXT PRIMARY KEY, value INTEGER NOT NULL);
             CREATE TABLE {} (tbl TEXT PRIMARY KEY, fields TEXT NOT NULL);",
            SEQUENCE_TABLE, SCHEMA_TABLE
        ))?;
        state.columns.clear();
        state.types.clear();
        state.unique.clear();
        state.changes = false;
        Ok(())
    }
}
