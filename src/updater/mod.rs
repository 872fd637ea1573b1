// src/updater/mod.rs

//! Updater service
//!
//! A small always-on HTTP service, separate from the controller, that
//! accepts packages and launches installers. Installers restart the
//! controller, so the process that starts them must not be the controller
//! itself. The controller reaches this service through
//! [`HttpSupervisor`](crate::supervisor::HttpSupervisor).
//!
//! Only one instance runs per appliance; the service holds the updater
//! [`ProcessLock`] for its lifetime. It is meant for the trusted local
//! network and performs no authentication.

pub mod routes;

pub use routes::build_router;

use crate::backup::BackupManager;
use crate::config::ArmnasConfig;
use crate::lock::ProcessLock;
use crate::store::PackageStore;
use crate::supervisor::Launcher;
use anyhow::Context;
use std::sync::Arc;
use std::time::Instant;

/// Shared updater state
pub struct UpdaterState {
    pub launcher: Launcher,
    pub backups: BackupManager,
    pub started: Instant,
}

pub type SharedState = Arc<UpdaterState>;

impl UpdaterState {
    pub fn new(store: PackageStore, backups: BackupManager) -> Self {
        Self {
            launcher: Launcher::new(store),
            backups,
            started: Instant::now(),
        }
    }

    pub fn store(&self) -> &PackageStore {
        self.launcher.store()
    }
}

/// Run the updater service until shut down
pub async fn run_updater(config: ArmnasConfig) -> anyhow::Result<()> {
    let addr = config.updater_bind_addr()?;
    let _lock = ProcessLock::try_acquire(&config.updater.lock_path, "updater service")?;

    tracing::info!("Starting armnas updater {} on {}", env!("CARGO_PKG_VERSION"), addr);
    tracing::info!("Staging directory: {:?}", config.paths.staging_dir);

    let store = PackageStore::from_config(&config)?;
    tokio::fs::create_dir_all(store.staging_dir())
        .await
        .with_context(|| format!("Failed to create {}", store.staging_dir().display()))?;

    let backups = BackupManager::new(&config.paths.backup_dir, &config.paths.install_dir)
        .with_excludes(&config.backup.exclude)?;
    let app = build_router(Arc::new(UpdaterState::new(store, backups)));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Updater ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::api::shutdown_signal())
        .await?;
    tracing::info!("Updater shut down");
    Ok(())
}
