//! Segments: groups of models stored and sharded together.

use std::sync::Arc;

use super::model::Model;
use crate::driver::Driver;
use crate::error::Error;

/// A named group of models that always share buckets.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Domain the segment belongs to; prefixes every table name.
    pub domain: String,
    /// Segment name, unique within the registry. Buckets and topologies
    /// are keyed by it.
    pub name: String,
    /// Models in registration order.
    pub models: Vec<Arc<Model>>,
}

impl Segment {
    /// Create an empty segment.
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            models: Vec::new(),
        }
    }

    /// Add a model, deriving its table name.
    pub fn with_model(mut self, mut model: Model) -> Self {
        model.table = table_name(&self.domain, &self.name, &model.class);
        self.models.push(Arc::new(model));
        self
    }

    /// Find a model by class name.
    pub fn model(&self, class: &str) -> Option<&Arc<Model>> {
        self.models.iter().find(|m| m.class == class)
    }

    /// Find a model by physical table name.
    pub fn model_for_table(&self, table: &str) -> Option<&Arc<Model>> {
        self.models.iter().find(|m| m.table == table)
    }

    /// Physical table names in registration order.
    pub fn tables(&self) -> Vec<String> {
        self.models.iter().map(|m| m.table.clone()).collect()
    }

    /// Whether every model allows spreading over shards.
    pub fn is_shardable(&self) -> bool {
        self.models.iter().all(|m| m.sharded)
    }
}

/// Synchronise every table of `segment` on `driver`.
///
/// Bootstrap hooks run for tables created by this call. Returns the names
/// of the created tables.
pub fn sync_segment(driver: &dyn Driver, segment: &Segment) -> Result<Vec<String>, Error> {
    let mut created = Vec::new();
    for model in &segment.models {
        if driver.sync_table(&model.table, model)? {
            model.bootstrap(driver)?;
            created.push(model.table.clone());
        }
    }
    if !created.is_empty() {
        tracing::debug!(segment = %segment.name, tables = ?created, "tables created");
    }
    Ok(created)
}

/// Derive `domain_segment_class` in snake case.
///
/// The segment part is dropped when it repeats the domain, so the
/// `sharding` system segment yields `sharding_bucket` rather than
/// `sharding_sharding_bucket`.
pub fn table_name(domain: &str, segment: &str, class: &str) -> String {
    let domain = snake_case(domain);
    let segment = snake_case(segment);
    let class = snake_case(class);

    let mut parts = Vec::with_capacity(3);
    if !domain.is_empty() {
        parts.push(domain.clone());
    }
    if !segment.is_empty() && segment != domain {
        parts.push(segment);
    }
    parts.push(class);
    parts.join("_")
}

/// Convert `CamelCase` / `mixed.Case-name` into `snake_case`.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for ch in input.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}
