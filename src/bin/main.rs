//! qstreams daemon.
//!
//! ```text
//! qstreamsd [--config FILE] [--storage-root DIR] [--log-filter FILTER] <COMMAND>
//!
//! Commands:
//!   run      Run the stream engine until interrupted
//!   submit   Register a stream definition to be started by the next `run`
//!   list     List stored streams and their last known state
//! ```
//!
//! See [`qstreams::config`] for the configuration sources and their precedence.

use clap::Parser;
use qstreams::config::{CliArgs, Command, Settings};
use qstreams::{spec, Engine};
use qstreams_store::{FileStore, StateStore, StreamRecord, StreamSpec, StreamState};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(settings: &Settings, store: Arc<FileStore>) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::from_settings(&settings.engine, store)?;
    let restored = engine.restore().await?;
    tracing::info!(restored, root = %settings.storage.root.display(), "qstreams engine started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = engine.spawn_metrics_flusher(settings.engine.metrics_flush_interval(), shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    engine.shutdown().await;
    let _ = shutdown_tx.send(true);
    flusher.await?;
    Ok(())
}

async fn submit(store: &FileStore, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read(file).await?;
    let definition: StreamSpec = serde_json::from_slice(&raw)?;
    let mut definition = spec::prepare(definition)?;
    definition.id = spec::new_stream_id();

    store
        .save_stream(&StreamRecord::new(definition.clone(), StreamState::Submitted))
        .await?;
    println!("{}", definition.id);
    Ok(())
}

async fn list(store: &FileStore) -> Result<(), Box<dyn std::error::Error>> {
    for record in store.list_streams().await? {
        println!(
            "{}\t{}\t{}\t{}ms\t{} -> {}",
            record.spec.id,
            record.state,
            record.spec.name,
            record.spec.source.interval_ms,
            record.spec.source.endpoint,
            record.spec.destination.url,
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let cli = CliArgs::parse();
    let settings = Settings::new(&cli)?;
    init_tracing(&settings.log.filter);

    let store = Arc::new(FileStore::open(&settings.storage.root).await?);

    match cli.command {
        Command::Run { .. } => run(&settings, store).await,
        Command::Submit { ref file } => submit(&store, file).await,
        Command::List => list(&store).await,
    }
}
