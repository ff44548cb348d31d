//! wardend - domain control plane daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden_core::config::WardenConfig;
use warden_core::lifecycle::LifecycleController;
use warden_core::registry::store::RegistryStore;
use warden_core::registry::DomainRegistry;

use warden_daemon::balancer::MemoryBalancer;
use warden_daemon::context::WardenContext;
use warden_daemon::state::DaemonStateHandle;

#[derive(Debug, Parser)]
#[command(name = "wardend", about = "Domain control plane daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Registry snapshot path (overrides the configuration file).
    #[arg(long, value_name = "FILE")]
    store: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => WardenConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => WardenConfig::default(),
    };

    let store_path = args
        .store
        .clone()
        .unwrap_or_else(|| config.daemon.store_file.clone());
    let store = RegistryStore::new(store_path);

    let registry = if store.exists() {
        let lock = store.lock_shared().context("locking registry store")?;
        store.load(&lock).context("loading registry snapshot")?
    } else {
        info!(path = %store.path().display(), "no registry snapshot, creating a fresh one");
        let registry = DomainRegistry::new();
        let lock = store.lock_exclusive().context("locking registry store")?;
        store
            .save(&registry, &lock)
            .context("writing initial registry snapshot")?;
        registry
    };
    info!(domains = registry.len(), "registry loaded");
    let registry = Arc::new(tokio::sync::RwLock::new(registry));

    // No hypervisor adapter is linked into this build; the offline
    // context keeps registry operations available and fails everything
    // else closed.
    let context = WardenContext::offline();
    warn!("running with offline collaborators; lifecycle operations will fail closed");

    let (admission, balancer_task) = MemoryBalancer::spawn(
        Arc::clone(&context.hypervisor),
        config.balancer,
        config.daemon.admission,
        config.daemon.balance_interval,
    );

    let controller = Arc::new(LifecycleController::with_store(
        Arc::clone(&registry),
        store,
        context.collaborators(Arc::new(admission)),
        config.lifecycle.clone(),
    ));
    let state = Arc::new(DaemonStateHandle::new(controller, config));

    info!("warden daemon started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    state.request_shutdown();
    balancer_task.abort();
    info!(uptime_secs = state.uptime_secs(), "warden daemon stopped");
    Ok(())
}
