//! Entity references and typed row decoding.

use std::fmt;

use crate::error::Error;
use crate::value::{Row, Value};

/// A typed entity with an explicit row mapping.
///
/// Implemented by the system entities (buckets, storages, topologies,
/// migration cursors) so they can be read and written through any driver
/// without reflection.
pub trait Entity: Sized {
    /// Class name the entity is registered under.
    const CLASS: &'static str;

    /// Encode into a row.
    fn to_row(&self) -> Row;

    /// Decode from a row.
    fn from_row(row: &Row) -> Result<Self, Error>;
}

/// How a caller names an entity: by class or by table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    /// A registered class name, e.g. `Activity`.
    Class(String),
    /// A physical table (`app_activity_activity`) or a dotted logical
    /// name (`activity.Activity`).
    Table(String),
}

impl EntityRef {
    /// Reference a class by name.
    pub fn class(name: impl Into<String>) -> Self {
        EntityRef::Class(name.into())
    }

    /// Reference a table by name.
    pub fn table(name: impl Into<String>) -> Self {
        EntityRef::Table(name.into())
    }

    /// Reference a typed entity.
    pub fn of<E: Entity>() -> Self {
        EntityRef::Class(E::CLASS.to_string())
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Class(name) => write!(f, "class {}", name),
            EntityRef::Table(name) => write!(f, "table {}", name),
        }
    }
}

/// Read a required non-negative integer field.
pub fn get_u64(row: &Row, field: &str) -> Result<u64, Error> {
    row.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::InvalidData(format!("field {} is not an unsigned integer", field)))
}

/// Read an optional non-negative integer field, `0` when absent or null.
pub fn get_u64_or_zero(row: &Row, field: &str) -> Result<u64, Error> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(_) => get_u64(row, field),
    }
}

/// Read a required string field.
pub fn get_string(row: &Row, field: &str) -> Result<String, Error> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidData(format!("field {} is not a string", field)))
}
