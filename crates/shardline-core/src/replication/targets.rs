//! Where the changes of one storage go.

use std::collections::HashMap;
use std::sync::Arc;

use crate::database::Database;
use crate::driver::Driver;
use crate::error::Error;
use crate::locator::Bucket;
use crate::topology::{Topology, TopologyStatus};

/// A replica bucket and its driver.
#[derive(Clone)]
pub struct Target {
    /// The replica bucket.
    pub bucket: Bucket,
    /// Driver of the replica's storage.
    pub driver: Arc<dyn Driver>,
}

/// Replica destinations of every table with a primary on one storage.
#[derive(Default, Clone)]
pub struct Targets {
    by_table: HashMap<String, Vec<Target>>,
}

impl Targets {
    /// Collect the destinations for the primaries hosted on `storage`.
    ///
    /// Only non-stale topologies with replicas contribute; unassigned
    /// replicas are skipped.
    pub fn build(db: &Database, storage: u64) -> Result<Self, Error> {
        let registry = db.registry();
        let locator = db.locator();
        let mut targets = Targets::default();

        for segment in registry.segments().filter(|s| !registry.is_system(&s.name)) {
            let buckets = locator.buckets(&segment.name)?;
            for topology in Topology::history(db.core().as_ref(), &segment.name)? {
                if topology.status == TopologyStatus::Stale || topology.replicas == 0 {
                    continue;
                }
                let version: Vec<&Bucket> = buckets
                    .iter()
                    .filter(|b| b.version == topology.version)
                    .collect();
                for primary in version
                    .iter()
                    .filter(|b| b.is_primary() && b.storage == storage)
                {
                    for replica in version
                        .iter()
                        .filter(|b| !b.is_primary() && b.is_assigned() && b.same_shard(primary))
                    {
                        let driver = locator.driver(replica)?;
                        for table in segment.tables() {
                            targets.by_table.entry(table).or_default().push(Target {
                                bucket: (*replica).clone(),
                                driver: driver.clone(),
                            });
                        }
                    }
                }
            }
        }

        tracing::debug!(storage, tables = targets.by_table.len(), "replication targets");
        Ok(targets)
    }

    /// Destinations of a table.
    pub fn get(&self, table: &str) -> Option<&[Target]> {
        self.by_table.get(table).map(Vec::as_slice)
    }

    /// Whether no table has a destination.
    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }

    /// Tables with destinations, sorted.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.by_table.keys().map(String::as_str).collect();
        tables.sort_unstable();
        tables
    }
}
