//! JSON schema files describing segments and models.
//!
//! Lets processes that do not link the application's model code (the
//! worker binary) build the same [`Registry`].
//!
//! ```json
//! {
//!   "segments": [
//!     {
//!       "domain": "app",
//!       "name": "activity",
//!       "models": [
//!         {
//!           "class": "Activity",
//!           "fields": [{ "name": "kind", "type": "string" }],
//!           "indexes": [{ "name": "by_kind", "fields": ["kind"] }],
//!           "key": "id"
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::field::{FieldDef, IndexDef};
use super::model::Model;
use super::registry::Registry;
use super::segment::Segment;
use crate::error::Error;

/// Top-level schema document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    /// Segments to register.
    #[serde(default)]
    pub segments: Vec<SegmentEntry>,
}

/// One segment in a schema file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEntry {
    /// Domain prefix.
    pub domain: String,
    /// Segment name.
    pub name: String,
    /// Models in the segment.
    pub models: Vec<ModelEntry>,
}

/// One model in a schema file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Class name.
    pub class: String,
    /// Fields besides the implicit integer `id`.
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Whether rows may spread over shards.
    #[serde(default = "default_sharded")]
    pub sharded: bool,
    /// Routing key field, `id` when omitted.
    #[serde(default)]
    pub key: Option<String>,
}

fn default_sharded() -> bool {
    true
}

impl SchemaFile {
    /// Parse a schema document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a schema file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidData(format!("failed to read schema {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Register every segment into `registry`.
    pub fn register_into(&self, registry: &mut Registry) -> Result<(), Error> {
        for entry in &self.segments {
            registry.register(entry.to_segment())?;
        }
        Ok(())
    }

    /// Build a fresh registry from this document.
    pub fn into_registry(self) -> Result<Registry, Error> {
        let mut registry = Registry::new();
        self.register_into(&mut registry)?;
        Ok(registry)
    }
}

impl SegmentEntry {
    fn to_segment(&self) -> Segment {
        self.models
            .iter()
            .fold(Segment::new(&self.domain, &self.name), |segment, entry| {
                segment.with_model(entry.to_model())
            })
    }
}

impl ModelEntry {
    fn to_model(&self) -> Model {
        let mut model = Model::new(&self.class).with_fields(self.fields.iter().cloned());
        for index in &self.indexes {
            model = model.with_index(index.clone());
        }
        if !self.sharded {
            model = model.unsharded();
        }
        match &self.key {
            Some(field) if field != crate::value::ID_FIELD => model.with_key_field(field.clone()),
            _ => model,
        }
    }
}
