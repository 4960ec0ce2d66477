//! Binary encoding of rows and change entries for the sled driver.

use rkyv::{Archive, Deserialize, Serialize};

use super::change::{Action, Change};
use crate::error::Error;
use crate::value::{Context, Row, Value};

/// One named value.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct FieldValue {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: Value,
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct RowRecord {
    /// Fields in name order.
    pub fields: Vec<FieldValue>,
}

/// A stored change log entry.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Log sequence number.
    pub lsn: u64,
    /// Physical table.
    pub table: String,
    /// Action name (`create`, `update`, `delete`).
    pub action: String,
    /// Row snapshot.
    pub data: Vec<FieldValue>,
    /// Request context.
    pub context: Vec<FieldValue>,
    /// Target listener.
    pub listener: String,
}

fn to_fields(map: &Row) -> Vec<FieldValue> {
    map.iter()
        .map(|(name, value)| FieldValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn from_fields(fields: Vec<FieldValue>) -> Row {
    fields.into_iter().map(|f| (f.name, f.value)).collect()
}

/// sled values are not guaranteed to be aligned.
fn aligned(bytes: &[u8]) -> rkyv::util::AlignedVec<16> {
    let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
    aligned.extend_from_slice(bytes);
    aligned
}

impl RowRecord {
    /// Serialize a row.
    pub fn encode(row: &Row) -> Result<Vec<u8>, Error> {
        let record = RowRecord {
            fields: to_fields(row),
        };
        rkyv::to_bytes::<rkyv::rancor::Error>(&record)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a row.
    pub fn decode(bytes: &[u8]) -> Result<Row, Error> {
        let record = rkyv::from_bytes::<RowRecord, rkyv::rancor::Error>(&aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(from_fields(record.fields))
    }
}

impl ChangeRecord {
    /// Serialize a change.
    pub fn encode(change: &Change) -> Result<Vec<u8>, Error> {
        let record = ChangeRecord {
            lsn: change.id,
            table: change.table.clone(),
            action: change.action.as_str().to_string(),
            data: to_fields(&change.data),
            context: to_fields(&change.context),
            listener: change.listener.clone(),
        };
        rkyv::to_bytes::<rkyv::rancor::Error>(&record)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a change. Unknown actions are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Change, Error> {
        let record = rkyv::from_bytes::<ChangeRecord, rkyv::rancor::Error>(&aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        let action: Action = record.action.parse()?;
        let context: Context = from_fields(record.context);
        Ok(Change {
            id: record.lsn,
            table: record.table,
            action,
            data: from_fields(record.data),
            context,
            listener: record.listener,
        })
    }
}
