//! sync-daemon: collaborative workspace synchronization daemon.
//!
//! Serves the three WebSocket endpoints editor clients speak to: the
//! document sync hub, the presence relay and the event bus.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sync_core::engine::DocumentEngine;
use sync_core::objects::{InMemoryObjectStore, ObjectStore};
use sync_core::store::ProjectStore;
use sync_core::tree::AssetTree;
use sync_core::DocumentManager;

use sync_daemon::blob_dir::DirObjectStore;
use sync_daemon::snapshot::load_store;
use sync_daemon::{MessengerServer, RealtimeHub, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Collaborative workspace synchronization daemon")]
struct Args {
    /// Address of the document sync endpoint
    #[arg(long, default_value = "0.0.0.0:3001")]
    sync_listen: String,

    /// Address of the presence relay endpoint
    #[arg(long, default_value = "0.0.0.0:3002")]
    relay_listen: String,

    /// Address of the event bus endpoint
    #[arg(long, default_value = "0.0.0.0:3003")]
    events_listen: String,

    /// JSON store snapshot to serve rows from (omit to run on built-in
    /// defaults only)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Directory for uploaded binary payloads (in-memory if omitted)
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Disable the default environment-map bootstrap for new scenes
    #[arg(long)]
    no_default_skybox: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug
    // with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info,sync_daemon=info,sync_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting sync-daemon");

    let store: Option<Arc<dyn ProjectStore>> = match &args.store {
        Some(path) => Some(load_store(path)?),
        None => {
            info!("no store snapshot configured; documents seed from built-in defaults");
            None
        }
    };

    let objects: Arc<dyn ObjectStore> = match &args.blob_dir {
        Some(path) => {
            info!("storing uploaded blobs under {}", path.display());
            Arc::new(DirObjectStore::new(path.clone()))
        }
        None => Arc::new(InMemoryObjectStore::new()),
    };

    let engine = Arc::new(DocumentEngine::new());
    let mut manager = DocumentManager::new(Arc::clone(&engine))
        .with_object_store(objects)
        .with_env_map(!args.no_default_skybox);
    if let Some(store) = &store {
        manager = manager.with_store(Arc::clone(store));
    }
    let manager = Arc::new(manager);

    manager.seed_from_store().await;

    let tree = Arc::new(AssetTree::new(Arc::clone(&engine), store));

    let messenger = Arc::new(MessengerServer::new());
    let relay = Arc::new(RelayServer::new());
    let hub = Arc::new(RealtimeHub::new(
        engine,
        manager,
        tree,
        messenger.publisher(),
    ));

    let sync_listener = RealtimeHub::bind(&args.sync_listen).await?;
    let relay_listener = RelayServer::bind(&args.relay_listen).await?;
    let events_listener = MessengerServer::bind(&args.events_listen).await?;

    tokio::spawn(Arc::clone(&hub).run(sync_listener));
    tokio::spawn(Arc::clone(&relay).run(relay_listener));
    tokio::spawn(Arc::clone(&messenger).run(events_listener));

    info!("daemon running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    Ok(())
}
