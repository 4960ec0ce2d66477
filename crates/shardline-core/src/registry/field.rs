//! Field and index definitions.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Scalar column types understood by every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// 64-bit signed integer.
    Int,
    /// 64-bit floating point.
    Float,
    /// UTF-8 string.
    String,
    /// Boolean.
    Bool,
    /// Binary data.
    Bytes,
}

impl FieldType {
    /// Zero value used when a field has no explicit default.
    pub fn zero(&self) -> Value {
        match self {
            FieldType::Int => Value::Int(0),
            FieldType::Float => Value::Float(0.0),
            FieldType::String => Value::String(String::new()),
            FieldType::Bool => Value::Bool(false),
            FieldType::Bytes => Value::Bytes(Vec::new()),
        }
    }

    /// Check whether a value fits this column type. Null always fits.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (FieldType::Int, Value::Int(_))
                | (FieldType::Float, Value::Float(_))
                | (FieldType::Float, Value::Int(_))
                | (FieldType::String, Value::String(_))
                | (FieldType::Bool, Value::Bool(_))
                | (FieldType::Bytes, Value::Bytes(_))
        )
    }
}

/// A single field of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field (column) name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Default applied when a row omits the field.
    #[serde(default = "null_default")]
    pub default: Value,
}

fn null_default() -> Value {
    Value::Null
}

impl FieldDef {
    /// Create a field with a null default.
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: Value::Null,
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }
}

/// A secondary index on one or more fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique per table.
    pub name: String,
    /// Indexed fields in order.
    pub fields: Vec<String>,
    /// Reject rows whose indexed values collide.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index.
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
        }
    }

    /// Create a unique index.
    pub fn unique(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            unique: true,
            ..Self::new(name, fields)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        assert!(FieldType::Int.accepts(&Value::Int(1)));
        assert!(FieldType::Float.accepts(&Value::Int(1)));
        assert!(FieldType::String.accepts(&Value::Null));
        assert!(!FieldType::Bool.accepts(&Value::Int(1)));
    }

    #[test]
    fn test_field_from_json() {
        let field: FieldDef = serde_json::from_str(r#"{"name":"title","type":"string"}"#).unwrap();
        assert_eq!(field.ty, FieldType::String);
        assert!(field.default.is_null());

        let index: IndexDef =
            serde_json::from_str(r#"{"name":"by_owner","fields":["owner"],"unique":true}"#)
                .unwrap();
        assert!(index.unique);
    }
}
