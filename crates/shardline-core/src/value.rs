//! Runtime values carried in rows, filters and change contexts.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use rkyv::Archive;

/// A single field value.
///
/// Rows are flat maps of field name to value; nested documents are out of
/// scope for every driver.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(untagged)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
}

/// A row: field name to value, ordered by field name.
pub type Row = BTreeMap<String, Value>;

/// Per-request key/value bag snapshotted into every change entry.
pub type Context = BTreeMap<String, Value>;

/// Field name used as row identity by every driver.
pub const ID_FIELD: &str = "id";

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as u64. Negative integers yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as bytes reference.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
        }
    }

    /// Total order used for ids, cursors and range filters.
    ///
    /// Values of different kinds order by kind (null < bool < number <
    /// string < bytes); integers and floats compare numerically.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (a, b) if a.rank() == 2 && b.rank() == 2 => {
                let a = a.as_f64().unwrap_or_default();
                let b = b.as_f64().unwrap_or_default();
                a.total_cmp(&b)
            }
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    /// Approximate in-memory footprint, used for usage reporting.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) => s.len(),
            Value::Bytes(b) => b.len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => {
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build a [`Row`] from `field => value` pairs.
///
/// ```
/// use shardline_core::row;
///
/// let r = row! { "id" => 1, "title" => "hello" };
/// assert_eq!(r.len(), 2);
/// ```
#[macro_export]
macro_rules! row {
    () => { $crate::Row::new() };
    ($($field:expr => $value:expr),+ $(,)?) => {{
        let mut row = $crate::Row::new();
        $( row.insert(($field).to_string(), $crate::Value::from($value)); )+
        row
    }};
}

/// Approximate footprint of a whole row.
pub fn row_size(row: &Row) -> usize {
    row.iter().map(|(k, v)| k.len() + v.approx_size()).sum()
}

/// Read the identity field of a row.
pub fn row_id(row: &Row) -> Option<&Value> {
    row.get(ID_FIELD).filter(|v| !v.is_null())
}

/// Check that every `filter` field equals the row's field.
pub fn row_matches(row: &Row, filter: &Row) -> bool {
    filter.iter().all(|(field, expected)| {
        let actual = row.get(field).unwrap_or(&Value::Null);
        actual.total_cmp(expected) == Ordering::Equal
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cmp_mixed_numbers() {
        assert_eq!(Value::Int(2).total_cmp(&Value::Float(2.0)), Ordering::Equal);
        assert_eq!(Value::Int(1).total_cmp(&Value::Float(1.5)), Ordering::Less);
        assert_eq!(Value::Null.total_cmp(&Value::Int(0)), Ordering::Less);
        assert_eq!(
            Value::from("b").total_cmp(&Value::from("a")),
            Ordering::Greater
        );
    }

    #[test]
    fn test_row_macro_and_match() {
        let r = row! { "id" => 7, "name" => "seven", "active" => true };
        assert_eq!(row_id(&r), Some(&Value::Int(7)));
        assert!(row_matches(&r, &row! { "name" => "seven" }));
        assert!(!row_matches(&r, &row! { "name" => "eight" }));
        assert!(!row_matches(&r, &row! { "missing" => 1 }));
        assert!(row_matches(&r, &Row::new()));
    }

    #[test]
    fn test_null_id_is_absent() {
        let r = row! { "id" => Value::Null };
        assert!(row_id(&r).is_none());
    }

    #[test]
    fn test_json_shape() {
        let r = row! { "id" => 1, "title" => "x" };
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"id":1,"title":"x"}"#);
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
