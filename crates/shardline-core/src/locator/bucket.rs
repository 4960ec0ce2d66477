//! Buckets: one shard replica of a segment at one topology version.

use crate::error::Error;
use crate::registry::{get_string, get_u64, get_u64_or_zero, Entity, FieldDef, FieldType, IndexDef, Model};
use crate::row;
use crate::value::{Row, ID_FIELD};

use super::storage::CORE_STORAGE_ID;

/// A physical placement unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Bucket id; `0` for buckets not yet persisted.
    pub id: u64,
    /// Segment name.
    pub name: String,
    /// Topology version.
    pub version: u64,
    /// Shard index.
    pub shard: u64,
    /// Replica index; `0` is the primary.
    pub replica: u64,
    /// Assigned storage; `0` until first writable access.
    pub storage: u64,
}

impl Bucket {
    /// An unassigned bucket.
    pub fn new(name: impl Into<String>, version: u64, shard: u64, replica: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            version,
            shard,
            replica,
            storage: 0,
        }
    }

    /// The synthetic bucket the system segment resolves to.
    pub fn system(name: impl Into<String>) -> Self {
        Self {
            storage: CORE_STORAGE_ID,
            ..Self::new(name, 1, 0, 0)
        }
    }

    /// Whether this is the primary of its shard.
    pub fn is_primary(&self) -> bool {
        self.replica == 0
    }

    /// Whether a storage has been assigned.
    pub fn is_assigned(&self) -> bool {
        self.storage != 0
    }

    /// Whether `other` is a replica of this bucket's shard.
    pub fn same_shard(&self, other: &Bucket) -> bool {
        self.name == other.name && self.version == other.version && self.shard == other.shard
    }

    /// Filter locating this bucket by its natural key.
    pub fn natural_key(&self) -> Row {
        row! {
            "name" => self.name.as_str(),
            "version" => self.version,
            "shard" => self.shard,
            "replica" => self.replica,
        }
    }

    /// Model of the `sharding_bucket` table.
    pub fn model() -> Model {
        Model::new(Self::CLASS)
            .with_field(FieldDef::new("name", FieldType::String))
            .with_field(FieldDef::new("version", FieldType::Int))
            .with_field(FieldDef::new("shard", FieldType::Int))
            .with_field(FieldDef::new("replica", FieldType::Int))
            .with_field(FieldDef::new("storage", FieldType::Int).with_default(0))
            .with_index(IndexDef::unique(
                "name_version_shard_replica",
                &["name", "version", "shard", "replica"],
            ))
            .unsharded()
    }
}

impl Entity for Bucket {
    const CLASS: &'static str = "Bucket";

    fn to_row(&self) -> Row {
        let mut row = self.natural_key();
        row.insert("storage".to_string(), self.storage.into());
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
            shard: get_u64(row, "shard")?,
            replica: get_u64(row, "replica")?,
            storage: get_u64_or_zero(row, "storage")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_row() {
        let bucket = Bucket::new("activity", 2, 1, 0);
        assert!(bucket.is_primary());
        assert!(!bucket.is_assigned());

        let mut row = bucket.to_row();
        assert!(!row.contains_key("id"));
        row.insert("id".into(), 9.into());
        let back = Bucket::from_row(&row).unwrap();
        assert_eq!(back.id, 9);
        assert_eq!(back.shard, 1);
        assert!(back.same_shard(&Bucket::new("activity", 2, 1, 1)));
        assert!(!back.same_shard(&Bucket::new("activity", 1, 1, 1)));
    }

    #[test]
    fn test_system_bucket() {
        let bucket = Bucket::system("sharding");
        assert_eq!(bucket.storage, CORE_STORAGE_ID);
        assert!(bucket.is_primary());
    }
}
