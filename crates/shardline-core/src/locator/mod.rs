//! Bucket location and storage assignment.
//!
//! The locator answers "which bucket(s) hold this entity" for a segment:
//! it creates buckets on demand from the segment's topology, routes rows to
//! a shard by their key and assigns storages to buckets on first writable
//! access.

mod bucket;
mod caster;
mod shard;
mod storage;

pub use bucket::Bucket;
pub use caster::{CastContext, FixedCaster, StorageCaster, UsageCaster};
pub use shard::{shard_for, shard_key};
pub use storage::{Storage, CORE_STORAGE_ID, DEFAULT_TIER};

use std::sync::Arc;

use crate::driver::{Driver, DriverPool, REPLICATION_LISTENER};
use crate::error::Error;
use crate::migration::MigrationCursor;
use crate::registry::{sync_segment, Entity, EntityRef, Model, Registry, Segment};
use crate::row;
use crate::topology::Topology;
use crate::value::{Row, Value};

/// Domain and name of the segment holding the system tables.
pub const SYSTEM_SEGMENT: &str = "sharding";

/// Physical table of bucket rows.
pub const BUCKET_TABLE: &str = "sharding_bucket";

/// Physical table of storage rows.
pub const STORAGE_TABLE: &str = "sharding_storage";

/// The segment holding buckets, storages, topologies and migration cursors.
///
/// `core` is the storage row seeded on first start.
pub fn system_segment(core: Storage) -> Segment {
    Segment::new(SYSTEM_SEGMENT, SYSTEM_SEGMENT)
        .with_model(Bucket::model())
        .with_model(Storage::model(core))
        .with_model(Topology::model())
        .with_model(MigrationCursor::model())
}

/// Shard of `row` under `topology`, by the model's routing key.
///
/// Rows without a key land in shard 0.
pub fn shard_of(model: &Model, topology: &Topology, row: &Row) -> u64 {
    model
        .key(row)
        .map(|key| shard_for(&key, topology.shards))
        .unwrap_or(0)
}

/// Resolves entities to buckets.
pub struct Locator {
    registry: Arc<Registry>,
    pool: Arc<DriverPool>,
}

impl Locator {
    /// Create a locator over a registry and a driver pool.
    pub fn new(registry: Arc<Registry>, pool: Arc<DriverPool>) -> Self {
        Self { registry, pool }
    }

    fn core(&self) -> &Arc<dyn Driver> {
        self.pool.core()
    }

    /// Buckets holding `entity` for `data`.
    ///
    /// Reads return one primary per candidate shard. `writable` requires a
    /// single bucket and assigns it a storage; `multiple = false` requires a
    /// single bucket without assigning.
    pub fn get_buckets(
        &self,
        entity: &EntityRef,
        data: &Row,
        writable: bool,
        multiple: bool,
    ) -> Result<Vec<Bucket>, Error> {
        let resolved = self.registry.resolve(entity)?;
        let name = resolved.segment.name.as_str();
        if self.registry.is_system(name) {
            return Ok(vec![Bucket::system(name)]);
        }

        let topology = Topology::current(self.core().as_ref(), name)?;
        let mut buckets = self.buckets(name)?;
        if let Some(topology) = &topology {
            buckets.retain(|b| b.version == topology.version);
        }
        if buckets.is_empty() {
            buckets = self.generate_buckets(name, topology.as_ref())?;
        }

        if buckets.len() > 1 {
            if let (Some(topology), Some(key)) = (&topology, resolved.model.key(data)) {
                let shard = shard_for(&key, topology.shards);
                buckets.retain(|b| b.shard == shard);
            }
        }
        buckets.retain(Bucket::is_primary);

        if (writable || !multiple) && buckets.len() > 1 {
            return Err(Error::MultipleBuckets {
                name: name.to_string(),
                count: buckets.len(),
            });
        }
        if buckets.is_empty() {
            return Err(Error::NoBuckets(name.to_string()));
        }
        if writable {
            let bucket = self.assign_storage(&buckets[0], topology.as_ref())?;
            return Ok(vec![bucket]);
        }
        Ok(buckets)
    }

    /// Every bucket of a segment ordered by version, shard and replica.
    pub fn buckets(&self, name: &str) -> Result<Vec<Bucket>, Error> {
        let mut buckets = self
            .core()
            .find(BUCKET_TABLE, &row! { "name" => name })?
            .iter()
            .map(Bucket::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        buckets.sort_by_key(|b| (b.version, b.shard, b.replica));
        Ok(buckets)
    }

    /// Buckets of one topology version, created when missing.
    pub fn buckets_for(&self, topology: &Topology) -> Result<Vec<Bucket>, Error> {
        let mut buckets = self.buckets(&topology.name)?;
        buckets.retain(|b| b.version == topology.version);
        if buckets.is_empty() {
            buckets = self.generate_buckets(&topology.name, Some(topology))?;
        }
        Ok(buckets)
    }

    /// Create `shards * (replicas + 1)` buckets for a layout.
    ///
    /// Without topology a single default bucket is created. A concurrent
    /// creator is detected through the unique index and its row re-read.
    pub fn generate_buckets(
        &self,
        name: &str,
        topology: Option<&Topology>,
    ) -> Result<Vec<Bucket>, Error> {
        let layout = topology
            .cloned()
            .unwrap_or_else(|| Topology::default_layout(name));

        let mut buckets = Vec::with_capacity((layout.shards * (layout.replicas + 1)) as usize);
        for shard in 0..layout.shards {
            for replica in 0..=layout.replicas {
                let bucket = Bucket::new(name, layout.version, shard, replica);
                let row = match self.core().create(BUCKET_TABLE, bucket.to_row()) {
                    Ok(row) => row,
                    Err(Error::UniqueViolation { .. }) => {
                        tracing::warn!(
                            segment = name,
                            version = layout.version,
                            shard,
                            replica,
                            "bucket created concurrently, re-reading"
                        );
                        self.core()
                            .find_or_fail(BUCKET_TABLE, &bucket.natural_key())?
                    }
                    Err(err) => return Err(err),
                };
                buckets.push(Bucket::from_row(&row)?);
            }
        }
        tracing::info!(
            segment = name,
            version = layout.version,
            count = buckets.len(),
            "buckets created"
        );
        Ok(buckets)
    }

    /// Assign a storage to `bucket` if it has none.
    ///
    /// Assigning a primary cascades to the unassigned replicas of its shard.
    /// Once a primary and a replica both have storages, the primary's
    /// storage tracks every segment table for the replication listener.
    pub fn assign_storage(
        &self,
        bucket: &Bucket,
        topology: Option<&Topology>,
    ) -> Result<Bucket, Error> {
        if bucket.is_assigned() {
            return Ok(bucket.clone());
        }
        let segment = self.segment(&bucket.name)?;
        let assigned = self.assign_one(bucket, &segment, topology)?;

        let siblings = self.buckets(&bucket.name)?;
        if assigned.is_primary() {
            for replica in siblings
                .iter()
                .filter(|b| !b.is_primary() && b.same_shard(&assigned))
            {
                let replica = self.assign_one(replica, &segment, topology)?;
                self.link_replica(&assigned, &replica, &segment)?;
            }
        } else if let Some(primary) = siblings
            .iter()
            .find(|b| b.is_primary() && b.same_shard(&assigned) && b.is_assigned())
        {
            self.link_replica(primary, &assigned, &segment)?;
        }
        Ok(assigned)
    }

    fn segment(&self, name: &str) -> Result<Arc<Segment>, Error> {
        self.registry
            .segment(name)
            .cloned()
            .ok_or_else(|| Error::InvalidTopologyName(name.to_string()))
    }

    fn assign_one(
        &self,
        bucket: &Bucket,
        segment: &Segment,
        topology: Option<&Topology>,
    ) -> Result<Bucket, Error> {
        // re-read: another caller may have assigned it meanwhile
        let current = Bucket::from_row(
            &self
                .core()
                .find_or_fail(BUCKET_TABLE, &row! { "id" => bucket.id })?,
        )?;
        if current.is_assigned() {
            return Ok(current);
        }

        let siblings = self.buckets(&segment.name)?;
        let ctx = CastContext {
            segment: &segment.name,
            bucket: &current,
            topology,
            siblings: &siblings,
            pool: &self.pool,
        };
        let storage = match segment.models.iter().find_map(|m| m.caster()) {
            Some(caster) => caster.cast(&ctx)?,
            None => UsageCaster.cast(&ctx)?,
        };

        self.core().update(
            BUCKET_TABLE,
            &Value::from(current.id),
            row! { "storage" => storage },
        )?;
        let driver = self.pool.get(storage)?;
        sync_segment(driver.as_ref(), segment)?;
        tracing::info!(
            segment = %segment.name,
            bucket = current.id,
            version = current.version,
            shard = current.shard,
            replica = current.replica,
            storage,
            "storage assigned"
        );
        Ok(Bucket { storage, ..current })
    }

    fn link_replica(&self, primary: &Bucket, replica: &Bucket, segment: &Segment) -> Result<(), Error> {
        let driver = self.pool.get(primary.storage)?;
        driver.register_changes()?;
        for table in segment.tables() {
            driver.track(REPLICATION_LISTENER, &table)?;
        }
        tracing::debug!(
            segment = %segment.name,
            primary = primary.storage,
            replica = replica.storage,
            "replication listener registered"
        );
        Ok(())
    }

    /// Driver of an assigned bucket.
    pub fn driver(&self, bucket: &Bucket) -> Result<Arc<dyn Driver>, Error> {
        if !bucket.is_assigned() {
            return Err(Error::InvalidData(format!(
                "bucket {} of {} has no storage",
                bucket.id, bucket.name
            )));
        }
        self.pool.get(bucket.storage)
    }
}
