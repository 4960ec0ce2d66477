//! The `Configure` job.

use super::{Topology, TopologyStatus};
use crate::database::Database;
use crate::error::Error;
use crate::job::Job;

/// Create or change the topology of a segment.
///
/// Fields left `None` are copied from the current version (or take the
/// default layout for a segment without topology).
#[derive(Debug, Clone, Default)]
pub struct Configure {
    /// Segment name.
    pub name: String,
    /// Requested shard count.
    pub shards: Option<u64>,
    /// Requested replicas per shard.
    pub replicas: Option<u64>,
    /// Requested storage tier.
    pub tier: Option<u64>,
}

impl Configure {
    /// Configure the named segment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Request a shard count.
    pub fn shards(mut self, shards: u64) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Request a replica count.
    pub fn replicas(mut self, replicas: u64) -> Self {
        self.replicas = Some(replicas);
        self
    }

    /// Request a storage tier.
    pub fn tier(mut self, tier: u64) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Layout requested on top of `base`.
    fn apply(&self, base: &Topology) -> Topology {
        Topology {
            id: 0,
            shards: self.shards.unwrap_or(base.shards),
            replicas: self.replicas.unwrap_or(base.replicas),
            tier: self.tier.unwrap_or(base.tier),
            ..base.clone()
        }
    }

    fn validate(&self, db: &Database) -> Result<(), Error> {
        let registry = db.registry();
        let segment = registry
            .segment(&self.name)
            .filter(|s| !registry.is_system(&s.name))
            .ok_or_else(|| Error::InvalidTopologyName(self.name.clone()))?;

        match self.shards {
            Some(0) => Err(Error::InvalidData(format!(
                "{} needs at least one shard",
                self.name
            ))),
            Some(shards) if shards > 1 && !segment.is_shardable() => Err(Error::InvalidData(
                format!("{} holds unsharded models", self.name),
            )),
            _ => Ok(()),
        }
    }

    fn has_primaries(&self, db: &Database, version: u64) -> Result<bool, Error> {
        Ok(db
            .locator()
            .buckets(&self.name)?
            .iter()
            .any(|b| b.version == version && b.is_primary()))
    }
}

impl Job for Configure {
    type Output = Topology;

    fn run(&self, db: &Database) -> Result<Topology, Error> {
        self.validate(db)?;
        let core = db.core();
        let history = Topology::history(core.as_ref(), &self.name)?;

        let Some(latest) = history.last() else {
            let default = Topology::default_layout(&self.name);
            let requested = self.apply(&default);
            if requested.same_layout(&default) || !self.has_primaries(db, 1)? {
                return requested.insert(core.as_ref());
            }
            // Data already sits in the implicit layout: record it as v1 and
            // migrate towards the request.
            default.insert(core.as_ref())?;
            return Topology {
                version: 2,
                status: TopologyStatus::Draft,
                ..requested
            }
            .insert(core.as_ref());
        };

        let requested = self.apply(latest);
        if requested.same_layout(latest) {
            return Ok(latest.clone());
        }
        if latest.status != TopologyStatus::Ready {
            return Err(Error::TopologyNotReady {
                name: latest.name.clone(),
                version: latest.version,
                status: latest.status.to_string(),
            });
        }

        let populated = self.has_primaries(db, latest.version)?;
        let next = Topology {
            version: latest.version + 1,
            status: if populated {
                TopologyStatus::Draft
            } else {
                TopologyStatus::Ready
            },
            ..requested
        }
        .insert(core.as_ref())?;
        if !populated {
            latest.mark(core.as_ref(), TopologyStatus::Stale)?;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::registry::{EntityRef, Model, Registry, Segment};
    use crate::row;

    fn open() -> Database {
        let mut registry = Registry::new();
        registry
            .register(Segment::new("app", "activity").with_model(Model::new("Activity")))
            .unwrap();
        registry
            .register(Segment::new("app", "settings").with_model(Model::new("Setting").unsharded()))
            .unwrap();
        let db = Database::open(DatabaseConfig::default(), registry).unwrap();
        for i in 0..4 {
            db.register_storage("memory", &format!("s{}", i), 1).unwrap();
        }
        db
    }

    #[test]
    fn test_first_topology_is_ready() {
        let db = open();
        let topology = db.run(&Configure::new("activity").shards(2)).unwrap();
        assert_eq!(topology.version, 1);
        assert_eq!(topology.status, TopologyStatus::Ready);
        assert_eq!(topology.shards, 2);
        assert_eq!(topology.replicas, 0);
    }

    #[test]
    fn test_populated_default_layout_becomes_v1() {
        let db = open();
        db.create(&EntityRef::class("Activity"), row! { "kind" => "x" })
            .unwrap();

        let next = db.run(&Configure::new("activity").shards(2)).unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(next.status, TopologyStatus::Draft);

        let history = Topology::history(db.core().as_ref(), "activity").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, TopologyStatus::Ready);
        assert_eq!(history[0].shards, 1);
    }

    #[test]
    fn test_unchanged_returns_current() {
        let db = open();
        let first = db.run(&Configure::new("activity").replicas(1)).unwrap();
        let again = db.run(&Configure::new("activity").replicas(1)).unwrap();
        assert_eq!(first, again);
        let plain = db.run(&Configure::new("activity")).unwrap();
        assert_eq!(plain.version, 1);
    }

    #[test]
    fn test_empty_segment_replaced_immediately() {
        let db = open();
        let v1 = db.run(&Configure::new("activity")).unwrap();
        let v2 = db.run(&Configure::new("activity").shards(3)).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.status, TopologyStatus::Ready);
        assert_eq!(v2.tier, v1.tier);
        let old = Topology::find_version(db.core().as_ref(), "activity", 1)
            .unwrap()
            .unwrap();
        assert_eq!(old.status, TopologyStatus::Stale);
    }

    #[test]
    fn test_draft_blocks_reconfiguration() {
        let db = open();
        db.run(&Configure::new("activity")).unwrap();
        db.create(&EntityRef::class("Activity"), row! { "kind" => "x" })
            .unwrap();
        db.run(&Configure::new("activity").shards(2)).unwrap();

        let err = db
            .run(&Configure::new("activity").shards(3))
            .unwrap_err();
        assert!(err.to_string().contains("Topology is not ready"));
    }

    #[test]
    fn test_validation() {
        let db = open();
        assert!(matches!(
            db.run(&Configure::new("missing")),
            Err(Error::InvalidTopologyName(_))
        ));
        assert!(matches!(
            db.run(&Configure::new("sharding")),
            Err(Error::InvalidTopologyName(_))
        ));
        assert!(matches!(
            db.run(&Configure::new("activity").shards(0)),
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            db.run(&Configure::new("settings").shards(2)),
            Err(Error::InvalidData(_))
        ));
        assert!(db.run(&Configure::new("settings").replicas(1)).is_ok());
    }
}
