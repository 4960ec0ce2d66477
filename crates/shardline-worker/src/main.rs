//! Shardline Worker - command-line job runner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardline_worker::{execute, open, Args, Error};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardline_worker=info,shardline_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.into_config();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        core_kind = %config.database.core_kind,
        core_dsn = %config.database.core_dsn,
        schema = ?config.schema,
        "starting shardline worker"
    );

    // Raised on ctrl+c; replication returns after the batch in flight
    let stop = Arc::new(AtomicBool::new(false));
    let signal = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!("received shutdown signal");
        signal.store(true, Ordering::SeqCst);
    });

    let output = tokio::task::spawn_blocking(move || {
        let db = open(&config)?;
        execute(&db, &config.command, stop)
    })
    .await
    .map_err(|e| Error::Aborted(e.to_string()))?;

    match output {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "job failed");
            Err(e.into())
        }
    }
}
