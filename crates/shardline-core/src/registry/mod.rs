//! Schema / segment registry.
//!
//! The registry maps entity classes and logical names to
//! `(domain, segment, table)` and carries the per-model hooks (routing key,
//! storage caster override, bootstrap). It is static metadata: built once,
//! then read by the locator, the drivers and every job.

mod entity;
mod field;
mod model;
#[allow(clippy::module_inception)]
mod registry;
mod schema_file;
mod segment;

pub use entity::{get_string, get_u64, get_u64_or_zero, Entity, EntityRef};
pub use field::{FieldDef, FieldType, IndexDef};
pub use model::{BootstrapFn, KeyFn, Model};
pub use registry::{Registry, Resolved};
pub use schema_file::{ModelEntry, SchemaFile, SegmentEntry};
pub use segment::{snake_case, sync_segment, table_name, Segment};
