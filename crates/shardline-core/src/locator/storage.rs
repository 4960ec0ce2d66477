//! Storage rows: where a bucket's data physically lives.

use crate::driver::Driver;
use crate::error::Error;
use crate::registry::{get_string, get_u64, get_u64_or_zero, Entity, FieldDef, FieldType, Model};
use crate::row;
use crate::value::{Row, ID_FIELD};

/// Id of the core storage holding the system tables.
pub const CORE_STORAGE_ID: u64 = 1;

/// Default storage tier.
pub const DEFAULT_TIER: u64 = 1;

/// A registered storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    /// Storage id; `1` is the core storage.
    pub id: u64,
    /// Driver kind (`memory`, `sled`, `sqlite`).
    pub kind: String,
    /// Connection string understood by the driver.
    pub dsn: String,
    /// Tier used to match topologies.
    pub tier: u64,
}

impl Storage {
    /// A storage row not yet persisted.
    pub fn new(kind: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind: kind.into(),
            dsn: dsn.into(),
            tier: DEFAULT_TIER,
        }
    }

    /// Set the tier.
    pub fn with_tier(mut self, tier: u64) -> Self {
        self.tier = tier;
        self
    }

    /// The core storage row.
    pub fn core(kind: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            id: CORE_STORAGE_ID,
            ..Self::new(kind, dsn)
        }
    }

    /// Model of the `sharding_storage` table.
    ///
    /// Its bootstrap hook seeds the `core` row the first time the table is
    /// created on the core storage.
    pub fn model(core: Storage) -> Model {
        Model::new(Self::CLASS)
            .with_field(FieldDef::new("type", FieldType::String))
            .with_field(FieldDef::new("dsn", FieldType::String))
            .with_field(FieldDef::new("tier", FieldType::Int).with_default(DEFAULT_TIER))
            .unsharded()
            .with_bootstrap(move |driver: &dyn Driver, model: &Model| {
                driver.find_or_create(
                    &model.table,
                    &row! { ID_FIELD => core.id },
                    core.to_row(),
                )?;
                Ok(())
            })
    }
}

impl Entity for Storage {
    const CLASS: &'static str = "Storage";

    fn to_row(&self) -> Row {
        let mut row = row! {
            "type" => self.kind.as_str(),
            "dsn" => self.dsn.as_str(),
            "tier" => self.tier,
        };
        if self.id != 0 {
            row.insert(ID_FIELD.to_string(), self.id.into());
        }
        row
    }

    fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(Self {
            id: get_u64(row, ID_FIELD)?,
            kind: get_string(row, "type")?,
            dsn: get_string(row, "dsn")?,
            tier: match get_u64_or_zero(row, "tier")? {
                0 => DEFAULT_TIER,
                tier => tier,
            },
        })
    }
}
