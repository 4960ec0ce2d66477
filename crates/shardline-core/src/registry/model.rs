//! Model (entity class) definitions.

use std::fmt;
use std::sync::Arc;

use super::field::{FieldDef, FieldType, IndexDef};
use crate::driver::Driver;
use crate::error::Error;
use crate::locator::StorageCaster;
use crate::value::{Row, Value, ID_FIELD};

/// Extracts the routing key from row data.
pub type KeyFn = Arc<dyn Fn(&Row) -> Option<Value> + Send + Sync>;

/// Seeds rows the first time a model's table is created on a storage.
pub type BootstrapFn = Arc<dyn Fn(&dyn Driver, &Model) -> Result<(), Error> + Send + Sync>;

/// An entity class mapped to one physical table.
#[derive(Clone)]
pub struct Model {
    /// Class name, unique within the registry.
    pub class: String,
    /// Physical table name. Assigned when the model joins a segment.
    pub table: String,
    /// Declared fields; always contains `id`.
    pub fields: Vec<FieldDef>,
    /// Secondary indexes.
    pub indexes: Vec<IndexDef>,
    /// Whether rows of this model may be spread over several shards.
    pub sharded: bool,
    key: Option<KeyFn>,
    caster: Option<Arc<dyn StorageCaster>>,
    bootstrap: Option<BootstrapFn>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("class", &self.class)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("indexes", &self.indexes)
            .field("sharded", &self.sharded)
            .field("custom_key", &self.key.is_some())
            .field("custom_caster", &self.caster.is_some())
            .field("bootstrap", &self.bootstrap.is_some())
            .finish()
    }
}

impl Model {
    /// Create a sharded model with an integer `id` field.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            table: String::new(),
            fields: vec![FieldDef::new(ID_FIELD, FieldType::Int)],
            indexes: Vec::new(),
            sharded: true,
            key: None,
            caster: None,
            bootstrap: None,
        }
    }

    /// Add a field. A field named `id` replaces the implicit one.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Add multiple fields.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        for field in fields {
            self = self.with_field(field);
        }
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Keep every row of this model in a single shard.
    pub fn unsharded(mut self) -> Self {
        self.sharded = false;
        self
    }

    /// Route rows by a custom key instead of `id`.
    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Row) -> Option<Value> + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(key));
        self
    }

    /// Route rows by the value of another field.
    pub fn with_key_field(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.with_key(move |row| row.get(&field).filter(|v| !v.is_null()).cloned())
    }

    /// Override storage selection for the model's segment.
    pub fn with_caster(mut self, caster: Arc<dyn StorageCaster>) -> Self {
        self.caster = Some(caster);
        self
    }

    /// Seed rows when the table is first created on a storage.
    pub fn with_bootstrap<F>(mut self, bootstrap: F) -> Self
    where
        F: Fn(&dyn Driver, &Model) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.bootstrap = Some(Arc::new(bootstrap));
        self
    }

    /// Routing key for a row: the key hook, or `id` by default.
    pub fn key(&self, row: &Row) -> Option<Value> {
        match &self.key {
            Some(key) => key(row),
            None => row.get(ID_FIELD).filter(|v| !v.is_null()).cloned(),
        }
    }

    /// The storage caster override, if declared.
    pub fn caster(&self) -> Option<&Arc<dyn StorageCaster>> {
        self.caster.as_ref()
    }

    /// Run the bootstrap hook, if any.
    pub fn bootstrap(&self, driver: &dyn Driver) -> Result<(), Error> {
        match &self.bootstrap {
            Some(hook) => hook(driver, self),
            None => Ok(()),
        }
    }

    /// Get a field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Type of the identity field.
    pub fn id_type(&self) -> FieldType {
        self.get_field(ID_FIELD)
            .map(|f| f.ty)
            .unwrap_or(FieldType::Int)
    }

    /// Unique indexes only.
    pub fn unique_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(|i| i.unique)
    }

    /// Fill declared fields missing from `row` with their defaults.
    pub fn apply_defaults(&self, row: &mut Row) {
        for field in &self.fields {
            if field.name == ID_FIELD {
                continue;
            }
            row.entry(field.name.clone())
                .or_insert_with(|| field.default.clone());
        }
    }
}
