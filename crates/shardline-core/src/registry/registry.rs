//! Registry of segments and models.

use std::collections::HashMap;
use std::sync::Arc;

use super::entity::EntityRef;
use super::model::Model;
use super::segment::{snake_case, Segment};
use crate::error::Error;

/// A model resolved together with its owning segment.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// The owning segment.
    pub segment: Arc<Segment>,
    /// The model.
    pub model: Arc<Model>,
}

impl Resolved {
    /// Physical table name.
    pub fn table(&self) -> &str {
        &self.model.table
    }
}

/// Static metadata: which class lives in which segment and table.
///
/// Built once at start-up with [`Registry::register`], then shared
/// read-only behind an `Arc`.
#[derive(Debug, Default)]
pub struct Registry {
    segments: Vec<Arc<Segment>>,
    by_segment: HashMap<String, usize>,
    by_class: HashMap<String, (usize, usize)>,
    by_table: HashMap<String, (usize, usize)>,
    system: Option<String>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment and all of its models.
    ///
    /// Segment names, class names and table names must be unique.
    pub fn register(&mut self, segment: Segment) -> Result<(), Error> {
        if self.by_segment.contains_key(&segment.name) {
            return Err(Error::InvalidData(format!(
                "segment {} already registered",
                segment.name
            )));
        }
        if segment.models.is_empty() {
            return Err(Error::InvalidData(format!(
                "segment {} has no models",
                segment.name
            )));
        }

        let index = self.segments.len();
        for model in &segment.models {
            if self.by_class.contains_key(&model.class) {
                return Err(Error::InvalidData(format!(
                    "class {} already registered",
                    model.class
                )));
            }
            if self.by_table.contains_key(&model.table) {
                return Err(Error::InvalidData(format!(
                    "table {} already registered",
                    model.table
                )));
            }
        }
        for (position, model) in segment.models.iter().enumerate() {
            self.by_class.insert(model.class.clone(), (index, position));
            self.by_table.insert(model.table.clone(), (index, position));
        }

        tracing::debug!(
            segment = %segment.name,
            domain = %segment.domain,
            models = segment.models.len(),
            "segment registered"
        );
        self.by_segment.insert(segment.name.clone(), index);
        self.segments.push(Arc::new(segment));
        Ok(())
    }

    /// Register the segment holding the system tables.
    pub fn register_system(&mut self, segment: Segment) -> Result<(), Error> {
        let name = segment.name.clone();
        self.register(segment)?;
        self.system = Some(name);
        Ok(())
    }

    /// Whether the named segment holds the system tables.
    pub fn is_system(&self, segment: &str) -> bool {
        self.system.as_deref() == Some(segment)
    }

    /// Get a segment by name.
    pub fn segment(&self, name: &str) -> Option<&Arc<Segment>> {
        self.by_segment.get(name).map(|&i| &self.segments[i])
    }

    /// All segments in registration order.
    pub fn segments(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.segments.iter()
    }

    /// Resolve an entity reference to its segment and model.
    pub fn resolve(&self, entity: &EntityRef) -> Result<Resolved, Error> {
        let found = match entity {
            EntityRef::Class(class) => self.by_class.get(class).copied(),
            EntityRef::Table(name) => self
                .by_table
                .get(name)
                .copied()
                .or_else(|| self.resolve_logical(name)),
        };

        let (segment, model) = found.ok_or_else(|| Error::UnknownEntity(entity.to_string()))?;
        let segment = self.segments[segment].clone();
        let model = segment.models[model].clone();
        Ok(Resolved { segment, model })
    }

    /// Resolve a physical table name.
    pub fn resolve_table(&self, table: &str) -> Result<Resolved, Error> {
        self.resolve(&EntityRef::table(table))
    }

    /// Parse `segment.class` (or `segment_class`) logical names.
    fn resolve_logical(&self, name: &str) -> Option<(usize, usize)> {
        let wanted = snake_case(name);
        for (index, segment) in self.segments.iter().enumerate() {
            let prefix = snake_case(&segment.name);
            let Some(rest) = wanted.strip_prefix(&prefix) else {
                continue;
            };
            let Some(class) = rest.strip_prefix('_') else {
                continue;
            };
            if let Some(position) = segment
                .models
                .iter()
                .position(|m| snake_case(&m.class) == class)
            {
                return Some((index, position));
            }
        }
        None
    }
}
