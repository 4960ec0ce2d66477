//! Persisted upgrade progress.

use crate::driver::Driver;
use crate::error::Error;
use crate::registry::{get_string, get_u64, get_u64_or_zero, Entity, FieldDef, FieldType, IndexDef, Model};
use crate::row;
use crate::value::{Row, Value, ID_FIELD};

/// Physical table of migration cursors.
pub const MIGRATION_TABLE: &str = "sharding_migration";

/// Where an upgrade towards `version` stopped.
///
/// `bucket` is the source primary being copied, `table` the table within
/// it and `key` the last id copied (`Null` before the first page).
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationCursor {
    /// Row id; `0` before the row is persisted.
    pub id: u64,
    /// Segment name.
    pub name: String,
    /// Target topology version.
    pub version: u64,
    /// Source bucket id.
    pub bucket: u64,
    /// Physical table.
    pub table: String,
    /// Last copied id.
    pub key: Value,
}

impl MigrationCursor {
    /// A cursor at the very start.
    pub fn start(name: impl Into<String>, version: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            version,
            bucket: 0,
            table: String::new(),
            key: Value::Null,
        }
    }

    /// Model of the `sharding_migration` table.
    pub fn model() -> Model {
        Model::new(Self::CLASS)
            .with_field(FieldDef::new("name", FieldType::String))
            .with_field(FieldDef::new("version", FieldType::Int))
            .with_field(FieldDef::new("bucket", FieldType::Int).with_default(0))
            .with_field(FieldDef::new("table", FieldType::String))
            .with_field(FieldDef::new("key", FieldType::Int))
            .with_index(IndexDef::unique("name_version", &["name", "version"]))
            .unsharded()
    }

    /// Load the cursor of an upgrade, if one was saved.
    pub fn load(core: &dyn Driver, name: &str, version: u64) -> Result<Option<Self>, Error> {
        core.find_one(MIGRATION_TABLE, &row! { "name" => name, "version" => version })?
            .map(|row| Self::from_row(&row))
            .transpose()
    }

    /// Persist the position.
    pub fn save(&mut self, core: &dyn Driver) -> Result<(), Error> {
        if self.id == 0 {
            let row = core.create(MIGRATION_TABLE, self.to_row())?;
            self.id = get_u64(&row, ID_FIELD)?;
        } else {
            core.update(MIGRATION_TABLE, &Value::from(self.id), self.to_row())?;
        }
        tracing::debug!(
            segment = %self.name,
            version = self.version,
            bucket = self.bucket,
            table = %self.table,
            key = %self.key,
            "migration cursor saved"
        );
        Ok(())
    }

    /// Remove the persisted cursor.
    pub fn remove(&self, core: &dyn Driver) -> Result<(), Error> {
        if self.id != 0 {
            core.delete(MIGRATION_TABLE, &Value::from(self.id))?;
        }
        Ok(())
    }
}

impl Entity for MigrationCursor {
    const CLASS: &'static str = "Migration";

    fn to_row(&self) -> Row {
        let mut row = row! {
            "name" => self.name.as_str(),
            "version" => self.version,
            "bucket" => self.bucket,
            "table" => self.table.as_str(),
            "key" => self.key.clone(),
        };
        if self.id != 0 {
            row.insert(ID_FIELD.to_string(), self.id.into());
        }
        row
    }

    fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: get_u64(row, ID_FIELD)?,
            name: get_string(row, "name")?,
            version: get_u64(row, "version")?,
            bucket: get_u64_or_zero(row, "bucket")?,
            table: get_string(row, "table")?,
            key: row.get("key").cloned().unwrap_or(Value::Null),
        })
    }
}
