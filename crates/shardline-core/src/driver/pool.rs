//! Connected drivers keyed by storage id.

use std::sync::Arc;

use dashmap::DashMap;

use super::{Connector, Driver};
use crate::error::Error;
use crate::locator::{Storage, CORE_STORAGE_ID, STORAGE_TABLE};
use crate::registry::Entity;
use crate::value::Row;

/// Lazily connects storages and caches their drivers.
pub struct DriverPool {
    core: Arc<dyn Driver>,
    connector: Arc<dyn Connector>,
    drivers: DashMap<u64, Arc<dyn Driver>>,
}

impl DriverPool {
    /// Create a pool around a connected core driver.
    pub fn new(core: Arc<dyn Driver>, connector: Arc<dyn Connector>) -> Self {
        let drivers = DashMap::new();
        drivers.insert(CORE_STORAGE_ID, core.clone());
        Self {
            core,
            connector,
            drivers,
        }
    }

    /// The core driver.
    pub fn core(&self) -> &Arc<dyn Driver> {
        &self.core
    }

    /// Driver of a storage, connecting on first use.
    pub fn get(&self, id: u64) -> Result<Arc<dyn Driver>, Error> {
        if let Some(driver) = self.drivers.get(&id) {
            return Ok(driver.clone());
        }
        let storage = self.storage(id)?;
        let driver = self.connector.connect(&storage.kind, &storage.dsn)?;
        Ok(self.drivers.entry(id).or_insert(driver).clone())
    }

    /// A storage row.
    pub fn storage(&self, id: u64) -> Result<Storage, Error> {
        self.core
            .find_one(STORAGE_TABLE, &crate::row! { "id" => id })?
            .map(|row| Storage::from_row(&row))
            .transpose()?
            .ok_or(Error::UnknownStorage(id))
    }

    /// Every registered storage ordered by id.
    pub fn storages(&self) -> Result<Vec<Storage>, Error> {
        let mut storages = self
            .core
            .find(STORAGE_TABLE, &Row::new())?
            .iter()
            .map(Storage::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        storages.sort_by_key(|s| s.id);
        Ok(storages)
    }

    /// Register a storage.
    ///
    /// The connection is opened before the row is written, so an
    /// unreachable dsn or unknown kind leaves no trace.
    pub fn register(&self, kind: &str, dsn: &str, tier: u64) -> Result<Storage, Error> {
        let driver = self.connector.connect(kind, dsn)?;
        let row = self
            .core
            .create(STORAGE_TABLE, Storage::new(kind, dsn).with_tier(tier).to_row())?;
        let storage = Storage::from_row(&row)?;
        self.drivers.insert(storage.id, driver);
        tracing::info!(storage = storage.id, kind, dsn, tier, "storage registered");
        Ok(storage)
    }

    /// Usage reported by a storage's driver.
    pub fn usage(&self, id: u64) -> Result<u64, Error> {
        self.get(id)?.usage()
    }

    /// Drop a cached driver so the next `get` reconnects.
    pub fn forget(&self, id: u64) {
        if id != CORE_STORAGE_ID {
            self.drivers.remove(&id);
        }
    }

    /// Storage ids currently connected.
    pub fn connected(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.drivers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DefaultConnector, MemoryDriver};
    use crate::locator::system_segment;
    use crate::registry::sync_segment;

    fn pool() -> DriverPool {
        let core: Arc<dyn Driver> = Arc::new(MemoryDriver::new("core"));
        sync_segment(core.as_ref(), &system_segment(Storage::core("memory", "core"))).unwrap();
        DriverPool::new(core, Arc::new(DefaultConnector::new()))
    }

    #[test]
    fn test_core_is_cached() {
        let pool = pool();
        assert_eq!(pool.connected(), vec![CORE_STORAGE_ID]);
        assert_eq!(pool.storage(CORE_STORAGE_ID).unwrap().kind, "memory");
        assert_eq!(pool.storages().unwrap().len(), 1);
    }

    #[test]
    fn test_register_and_get() {
        let pool = pool();
        let storage = pool.register("memory", "second", 1).unwrap();
        assert_eq!(storage.id, 2);
        pool.forget(storage.id);
        let driver = pool.get(storage.id).unwrap();
        driver.create("t", crate::row! { "id" => 1 }).unwrap();
        assert!(pool.usage(storage.id).unwrap() > 0);
        assert_eq!(pool.storages().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_storage() {
        let pool = pool();
        assert!(matches!(pool.get(42), Err(Error::UnknownStorage(42))));
        assert!(matches!(
            pool.register("tape", "x", 1),
            Err(Error::UnknownDriver(_))
        ));
        assert_eq!(pool.storages().unwrap().len(), 1);
    }
}
