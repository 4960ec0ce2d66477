//! Turning storage rows into connected drivers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;

use super::kv::SledDriver;
use super::memory::MemoryDriver;
use super::Driver;
use crate::error::Error;

/// Storage backend kinds understood by [`DefaultConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// [`MemoryDriver`]; the dsn names a shared instance.
    Memory,
    /// [`SledDriver`]; the dsn is a directory or `temporary`.
    Sled,
    /// `SqliteDriver`; the dsn is a file path or `:memory:`.
    Sqlite,
}

impl DriverKind {
    /// Name stored in the storage row.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Memory => "memory",
            DriverKind::Sled => "sled",
            DriverKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(DriverKind::Memory),
            "sled" => Ok(DriverKind::Sled),
            "sqlite" => Ok(DriverKind::Sqlite),
            other => Err(Error::UnknownDriver(other.to_string())),
        }
    }
}

/// Connects a `(kind, dsn)` pair to a driver.
pub trait Connector: Send + Sync {
    /// Open (or reuse) the driver for a storage.
    fn connect(&self, kind: &str, dsn: &str) -> Result<Arc<dyn Driver>, Error>;
}

/// Connector for the drivers shipped with this crate.
///
/// Connections are cached by `(kind, dsn)`, so two storage rows with the
/// same dsn share one driver. A sled dsn starting with `temporary` opens a
/// throwaway database; use distinct suffixes (`temporary-2`) for distinct
/// instances.
#[derive(Default)]
pub struct DefaultConnector {
    cache: DashMap<(DriverKind, String), Arc<dyn Driver>>,
}

impl DefaultConnector {
    /// Create a connector with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn open(kind: DriverKind, dsn: &str) -> Result<Arc<dyn Driver>, Error> {
        let driver: Arc<dyn Driver> = match kind {
            DriverKind::Memory => Arc::new(MemoryDriver::new(dsn)),
            DriverKind::Sled if dsn.starts_with("temporary") => Arc::new(SledDriver::temporary()?),
            DriverKind::Sled => Arc::new(SledDriver::open(dsn)?),
            #[cfg(feature = "sqlite")]
            DriverKind::Sqlite => Arc::new(super::sqlite::SqliteDriver::open(dsn)?),
            #[cfg(not(feature = "sqlite"))]
            DriverKind::Sqlite => {
                return Err(Error::UnknownDriver(
                    "sqlite (built without the sqlite feature)".to_string(),
                ))
            }
        };
        tracing::debug!(kind = %kind, dsn, "storage connected");
        Ok(driver)
    }
}

impl Connector for DefaultConnector {
    fn connect(&self, kind: &str, dsn: &str) -> Result<Arc<dyn Driver>, Error> {
        let kind: DriverKind = kind.parse()?;
        let key = (kind, dsn.to_string());
        if let Some(driver) = self.cache.get(&key) {
            return Ok(driver.clone());
        }
        let driver = Self::open(kind, dsn)?;
        Ok(self.cache.entry(key).or_insert(driver).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[test]
    fn test_kind_parse() {
        assert_eq!("sled".parse::<DriverKind>().unwrap(), DriverKind::Sled);
        assert!(matches!(
            "mongodb".parse::<DriverKind>(),
            Err(Error::UnknownDriver(k)) if k == "mongodb"
        ));
    }

    #[test]
    fn test_memory_instances_shared_by_dsn() {
        let connector = DefaultConnector::new();
        let a = connector.connect("memory", "one").unwrap();
        let b = connector.connect("memory", "one").unwrap();
        let c = connector.connect("memory", "two").unwrap();

        a.create("t", row! { "id" => 1 }).unwrap();
        assert!(b.find_one("t", &row! { "id" => 1 }).unwrap().is_some());
        assert!(c.find_one("t", &row! { "id" => 1 }).unwrap().is_none());
    }

    #[test]
    fn test_unknown_kind() {
        let connector = DefaultConnector::new();
        assert!(matches!(
            connector.connect("postgres", "x"),
            Err(Error::UnknownDriver(_))
        ));
    }
}
