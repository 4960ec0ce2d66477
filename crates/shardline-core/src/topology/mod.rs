//! Versioned shard / replica layouts per segment.
//!
//! Every segment has at most one `ready` topology at a time. Changing the
//! layout of a segment that already holds data creates a `draft` version
//! which a migration populates and then promotes, turning the previous
//! version `stale`.

mod configure;
mod status;

pub use configure::Configure;
pub use status::TopologyStatus;

use crate::driver::Driver;
use crate::error::Error;
use crate::locator::DEFAULT_TIER;
use crate::registry::{get_string, get_u64, Entity, FieldDef, FieldType, IndexDef, Model};
use crate::row;
use crate::value::{Row, Value, ID_FIELD};

/// Physical table of topology rows.
pub const TOPOLOGY_TABLE: &str = "sharding_topology";

/// One layout version of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Row id; `0` before the row is persisted.
    pub id: u64,
    /// Segment name.
    pub name: String,
    /// Version, starting at 1.
    pub version: u64,
    /// Lifecycle status.
    pub status: TopologyStatus,
    /// Number of shards.
    pub shards: u64,
    /// Replicas per shard, primary excluded.
    pub replicas: u64,
    /// Storage tier buckets of this version are cast to.
    pub tier: u64,
}

impl Topology {
    /// The implicit layout of a segment without topology rows.
    pub fn default_layout(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            version: 1,
            status: TopologyStatus::Ready,
            shards: 1,
            replicas: 0,
            tier: DEFAULT_TIER,
        }
    }

    /// Whether shards, replicas and tier equal `other`'s.
    pub fn same_layout(&self, other: &Topology) -> bool {
        self.shards == other.shards && self.replicas == other.replicas && self.tier == other.tier
    }

    /// Model of the `sharding_topology` table.
    pub fn model() -> Model {
        Model::new(Self::CLASS)
            .with_field(FieldDef::new("name", FieldType::String))
            .with_field(FieldDef::new("version", FieldType::Int))
            .with_field(FieldDef::new("status", FieldType::String))
            .with_field(FieldDef::new("shards", FieldType::Int).with_default(1))
            .with_field(FieldDef::new("replicas", FieldType::Int).with_default(0))
            .with_field(FieldDef::new("tier", FieldType::Int).with_default(DEFAULT_TIER))
            .with_index(IndexDef::unique("name_version", &["name", "version"]))
            .unsharded()
    }

    /// Every version of a segment, oldest first.
    pub fn history(core: &dyn Driver, name: &str) -> Result<Vec<Topology>, Error> {
        let mut history = core
            .find(TOPOLOGY_TABLE, &row! { "name" => name })?
            .iter()
            .map(Topology::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        history.sort_by_key(|t| t.version);
        Ok(history)
    }

    /// The ready version of a segment, if any.
    pub fn current(core: &dyn Driver, name: &str) -> Result<Option<Topology>, Error> {
        Ok(Self::history(core, name)?
            .into_iter()
            .rev()
            .find(|t| t.status == TopologyStatus::Ready))
    }

    /// A specific version.
    pub fn find_version(
        core: &dyn Driver,
        name: &str,
        version: u64,
    ) -> Result<Option<Topology>, Error> {
        core.find_one(TOPOLOGY_TABLE, &row! { "name" => name, "version" => version })?
            .map(|row| Topology::from_row(&row))
            .transpose()
    }

    /// Persist a new version.
    pub fn insert(mut self, core: &dyn Driver) -> Result<Topology, Error> {
        let row = core.create(TOPOLOGY_TABLE, self.to_row())?;
        self.id = get_u64(&row, ID_FIELD)?;
        tracing::info!(
            segment = %self.name,
            version = self.version,
            status = %self.status,
            shards = self.shards,
            replicas = self.replicas,
            "topology created"
        );
        Ok(self)
    }

    /// Move to `next`, validating the transition.
    pub fn mark(&self, core: &dyn Driver, next: TopologyStatus) -> Result<Topology, Error> {
        let status = self.status.transition(next)?;
        core.update(
            TOPOLOGY_TABLE,
            &Value::from(self.id),
            row! { "status" => status.as_str() },
        )?
        .ok_or_else(|| Error::NotFound {
            what: TOPOLOGY_TABLE.to_string(),
        })?;
        tracing::info!(segment = %self.name, version = self.version, status = %status, "topology status changed");
        Ok(Topology {
            status,
            ..self.clone()
        })
    }
}

impl Entity for Topology {
    const CLASS: &'static str = "Topology";

    fn to_row(&self) -> Row {
        let mut row = row! {
            "name" => self.name.as_str(),
            "version" => self.version,
            "status" => self.status.as_str(),
            "shards" => self.shards,
            "replicas" => self.replicas,
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
            name: get_string(row, "name")?,
            version: get_u64(row, "version")?,
            status: get_string(row, "status")?.parse()?,
            shards: get_u64(row, "shards")?,
            replicas: get_u64(row, "replicas")?,
            tier: get_u64(row, "tier")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;

    #[test]
    fn test_history_and_current() {
        let core = MemoryDriver::new("core");
        let v1 = Topology::default_layout("activity").insert(&core).unwrap();
        let v2 = Topology {
            id: 0,
            version: 2,
            status: TopologyStatus::Draft,
            shards: 2,
            ..v1.clone()
        }
        .insert(&core)
        .unwrap();

        let history = Topology::history(&core, "activity").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(Topology::current(&core, "activity").unwrap().unwrap().version, 1);

        v2.mark(&core, TopologyStatus::Ready).unwrap();
        v1.mark(&core, TopologyStatus::Stale).unwrap();
        assert_eq!(Topology::current(&core, "activity").unwrap().unwrap().version, 2);
        assert_eq!(
            Topology::find_version(&core, "activity", 1).unwrap().unwrap().status,
            TopologyStatus::Stale
        );
        assert!(Topology::current(&core, "other").unwrap().is_none());
    }

    #[test]
    fn test_invalid_mark() {
        let core = MemoryDriver::new("core");
        let v1 = Topology::default_layout("activity").insert(&core).unwrap();
        assert!(matches!(
            v1.mark(&core, TopologyStatus::Draft),
            Err(Error::InvalidTransition { .. })
        ));
    }
}
