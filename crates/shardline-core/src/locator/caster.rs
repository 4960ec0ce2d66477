//! Storage selection for newly assigned buckets.

use super::bucket::Bucket;
use super::storage::DEFAULT_TIER;
use crate::driver::DriverPool;
use crate::error::Error;
use crate::topology::Topology;

/// Everything a caster may look at when picking a storage.
pub struct CastContext<'a> {
    /// Segment of the bucket.
    pub segment: &'a str,
    /// The bucket being assigned.
    pub bucket: &'a Bucket,
    /// Topology the bucket belongs to, if the segment has one.
    pub topology: Option<&'a Topology>,
    /// Every bucket of the segment, all versions.
    pub siblings: &'a [Bucket],
    /// Connected drivers and storage rows.
    pub pool: &'a DriverPool,
}

impl CastContext<'_> {
    /// Tier requested by the topology, or the default tier.
    pub fn tier(&self) -> u64 {
        self.topology.map(|t| t.tier).unwrap_or(DEFAULT_TIER)
    }

    /// Whether another bucket of the segment already uses `storage`.
    pub fn is_taken(&self, storage: u64) -> bool {
        self.siblings
            .iter()
            .any(|b| b.storage == storage && b.id != self.bucket.id)
    }
}

/// Picks the storage of a bucket.
pub trait StorageCaster: Send + Sync {
    /// Return the id of the storage the bucket should live on.
    fn cast(&self, ctx: &CastContext<'_>) -> Result<u64, Error>;
}

/// Least-used storage of the requested tier not yet used by the segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageCaster;

impl StorageCaster for UsageCaster {
    fn cast(&self, ctx: &CastContext<'_>) -> Result<u64, Error> {
        let tier = ctx.tier();
        let mut best: Option<(u64, u64)> = None;
        for storage in ctx.pool.storages()? {
            if storage.tier != tier || ctx.is_taken(storage.id) {
                continue;
            }
            let usage = ctx.pool.usage(storage.id)?;
            if best.map_or(true, |current| (usage, storage.id) < current) {
                best = Some((usage, storage.id));
            }
        }
        tracing::debug!(segment = ctx.segment, bucket = ctx.bucket.id, tier, choice = ?best, "storage cast");
        best.map(|(_, id)| id).ok_or_else(|| Error::NoAvailableStorage {
            segment: ctx.segment.to_string(),
        })
    }
}

/// Always the same storage. Useful for pinning small segments.
#[derive(Debug, Clone, Copy)]
pub struct FixedCaster(pub u64);

impl StorageCaster for FixedCaster {
    fn cast(&self, ctx: &CastContext<'_>) -> Result<u64, Error> {
        ctx.pool.storage(self.0).map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::driver::{DefaultConnector, Driver, MemoryDriver};
    use crate::locator::{system_segment, Storage};
    use crate::registry::sync_segment;
    use crate::row;

    fn pool() -> DriverPool {
        let core: Arc<dyn Driver> = Arc::new(MemoryDriver::new("core"));
        sync_segment(core.as_ref(), &system_segment(Storage::core("memory", "core"))).unwrap();
        DriverPool::new(core, Arc::new(DefaultConnector::new()))
    }

    fn assigned(id: u64, storage: u64) -> Bucket {
        Bucket {
            id,
            storage,
            ..Bucket::new("activity", 1, id - 1, 0)
        }
    }

    #[test]
    fn test_least_used_wins() {
        let pool = pool();
        let busy = pool.register("memory", "busy", 1).unwrap();
        let idle = pool.register("memory", "idle", 1).unwrap();
        pool.get(busy.id)
            .unwrap()
            .create("t", row! { "id" => 1, "payload" => "x".repeat(64) })
            .unwrap();
        // the core storage carries the system tables, so it is the busiest
        pool.core().create("t", row! { "id" => 1, "payload" => "x".repeat(256) }).unwrap();

        let bucket = Bucket::new("activity", 1, 0, 0);
        let ctx = CastContext {
            segment: "activity",
            bucket: &bucket,
            topology: None,
            siblings: &[],
            pool: &pool,
        };
        assert_eq!(UsageCaster.cast(&ctx).unwrap(), idle.id);
    }

    #[test]
    fn test_siblings_and_tier_excluded() {
        let pool = pool();
        let second = pool.register("memory", "second", 1).unwrap();
        pool.register("memory", "cold", 2).unwrap();

        let siblings = vec![assigned(1, 1), assigned(2, second.id)];
        let bucket = Bucket::new("activity", 1, 2, 0);
        let ctx = CastContext {
            segment: "activity",
            bucket: &bucket,
            topology: None,
            siblings: &siblings,
            pool: &pool,
        };
        assert!(matches!(
            UsageCaster.cast(&ctx),
            Err(Error::NoAvailableStorage { segment }) if segment == "activity"
        ));
    }

    #[test]
    fn test_tier_from_topology() {
        let pool = pool();
        let cold = pool.register("memory", "cold", 2).unwrap();
        let topology = Topology {
            tier: 2,
            ..Topology::default_layout("activity")
        };
        let bucket = Bucket::new("activity", 1, 0, 0);
        let ctx = CastContext {
            segment: "activity",
            bucket: &bucket,
            topology: Some(&topology),
            siblings: &[],
            pool: &pool,
        };
        assert_eq!(UsageCaster.cast(&ctx).unwrap(), cold.id);
        assert_eq!(FixedCaster(1).cast(&ctx).unwrap(), 1);
        assert!(FixedCaster(9).cast(&ctx).is_err());
    }
}
