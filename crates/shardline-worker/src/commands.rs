//! Running one worker command against a database.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value as Json};
use shardline_core::{Configure, Database, Migrate, Replicate, Storage, Topology, Upgrade};

use crate::config::{Command, StorageCommand, WorkerConfig};
use crate::error::Error;

/// Open the database described by `config`.
pub fn open(config: &WorkerConfig) -> Result<Database, Error> {
    let registry = config.registry()?;
    Ok(Database::open(config.database.clone(), registry)?)
}

/// Run `command` and return its result as JSON.
///
/// `stop` ends a replication run once its log is drained.
pub fn execute(db: &Database, command: &Command, stop: Arc<AtomicBool>) -> Result<Json, Error> {
    match command {
        Command::Configure {
            name,
            shards,
            replicas,
            tier,
        } => {
            let job = Configure {
                name: name.clone(),
                shards: *shards,
                replicas: *replicas,
                tier: *tier,
            };
            Ok(topology_json(&db.run(&job)?))
        }
        Command::Migrate { name } => Ok(serde_json::to_value(db.run(&Migrate::new(name.as_str()))?)?),
        Command::Upgrade { name, iterations } => {
            let mut job = Upgrade::new(name.as_str());
            job.iterations = *iterations;
            Ok(serde_json::to_value(db.run(&job)?)?)
        }
        Command::Replicate {
            storage,
            limit,
            until_idle,
            ..
        } => {
            let mut job = Replicate::new(*storage).with_stop(stop);
            job.limit = *limit;
            job.until_idle = *until_idle;
            Ok(serde_json::to_value(db.run(&job)?)?)
        }
        Command::Storage(StorageCommand::Add { kind, dsn, tier }) => {
            Ok(storage_json(&db.register_storage(kind, dsn, *tier)?))
        }
        Command::Storage(StorageCommand::List) => Ok(Json::Array(
            db.storages()?.iter().map(storage_json).collect(),
        )),
    }
}

fn topology_json(topology: &Topology) -> Json {
    json!({
        "id": topology.id,
        "name": topology.name,
        "version": topology.version,
        "status": topology.status.as_str(),
        "shards": topology.shards,
        "replicas": topology.replicas,
        "tier": topology.tier,
    })
}

fn storage_json(storage: &Storage) -> Json {
    json!({
        "id": storage.id,
        "type": storage.kind,
        "dsn": storage.dsn,
        "tier": storage.tier,
    })
}
