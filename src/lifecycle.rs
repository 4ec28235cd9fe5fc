//! Ownership of the running engine and the hot-reload pipeline.
//!
//! The lifecycle holds the current `{config, engine}` pair behind one lock.
//! A reload validates the new config, builds a fresh engine (pool, checker,
//! scanner), migrates every active lease into the new pool by MAC-targeted
//! re-allocation, swaps the references, stops the old listener, and starts
//! the new one. A separate try-lock rejects overlapping reloads outright.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::server::DhcpEngine;

/// How long the old listener gets to release the port before the new engine
/// binds it. UDP clients retry naturally, so the window only needs to be
/// short.
const LISTENER_SETTLE: Duration = Duration::from_millis(300);

/// Delay for reloads scheduled right after a reservation edit, letting the
/// config write settle on disk first.
pub const RESERVATION_RELOAD_DELAY: Duration = Duration::from_millis(100);

/// Delay for reloads scheduled from a raw config upload.
pub const CONFIG_RELOAD_DELAY: Duration = Duration::from_millis(500);

struct Shared {
    config: Arc<Config>,
    engine: Arc<DhcpEngine>,
}

pub struct Lifecycle {
    config_path: PathBuf,
    shared: RwLock<Shared>,
    reloading: Mutex<()>,
}

impl Lifecycle {
    pub fn new<P: AsRef<Path>>(config_path: P, config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let engine = Arc::new(DhcpEngine::new(Arc::clone(&config))?);

        Ok(Arc::new(Self {
            config_path: config_path.as_ref().to_path_buf(),
            shared: RwLock::new(Shared { config, engine }),
            reloading: Mutex::new(()),
        }))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn config(&self) -> Arc<Config> {
        Arc::clone(&self.shared.read().await.config)
    }

    pub async fn engine(&self) -> Arc<DhcpEngine> {
        Arc::clone(&self.shared.read().await.engine)
    }

    /// Publishes an edited config immediately so subsequent API reads and
    /// validations see it; the engine keeps its own copy until a reload
    /// rebuilds it.
    pub async fn set_config(&self, config: Config) {
        self.shared.write().await.config = Arc::new(config);
    }

    /// Launches the current engine: background loops plus the UDP listener
    /// on its own task.
    pub async fn start(&self) {
        let engine = self.engine().await;
        log_config_summary(engine.config());
        engine.start_background_tasks();
        tokio::spawn(async move {
            if let Err(err) = engine.serve().await {
                error!("DHCP engine error: {err}");
            }
        });
    }

    /// Stops the running engine; in-flight handlers finish on their own.
    pub async fn shutdown(&self) {
        self.engine().await.stop();
    }

    /// The reload pipeline. Fails fast with [`Error::ReloadBusy`] when a
    /// reload is already underway; any other failure leaves the old engine
    /// running untouched.
    pub async fn reload(&self, new_config: Config) -> Result<()> {
        let _guard = self.reloading.try_lock().map_err(|_| Error::ReloadBusy)?;

        info!("configuration reload started");
        new_config.validate()?;

        let new_config = Arc::new(new_config);
        let new_engine = Arc::new(DhcpEngine::new(Arc::clone(&new_config))?);

        let old_engine = self.engine().await;
        migrate_leases(&old_engine, &new_engine).await;

        {
            let mut shared = self.shared.write().await;
            shared.config = Arc::clone(&new_config);
            shared.engine = Arc::clone(&new_engine);
        }

        old_engine.stop();
        tokio::time::sleep(LISTENER_SETTLE).await;

        new_engine.start_background_tasks();
        let engine = Arc::clone(&new_engine);
        tokio::spawn(async move {
            if let Err(err) = engine.serve().await {
                error!("DHCP engine error: {err}");
            }
        });

        info!("configuration reload complete");
        log_config_summary(&new_config);
        Ok(())
    }

    /// Re-reads the config file and reloads.
    pub async fn reload_from_disk(&self) -> Result<()> {
        let config = Config::load(&self.config_path).await?;
        self.reload(config).await
    }

    /// Schedules a disk reload after `delay`; failures are logged, not
    /// surfaced.
    pub fn schedule_reload(self: &Arc<Self>, delay: Duration) {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match lifecycle.reload_from_disk().await {
                Ok(()) => {}
                Err(Error::ReloadBusy) => warn!("scheduled reload skipped: reload in progress"),
                Err(err) => error!("scheduled reload failed: {err}"),
            }
        });
    }
}

/// Re-allocates every active dynamic lease from the old pool into the new
/// one. Static leases are already materialized from the new config, and
/// copying them would resurrect reservations the edit just deleted.
/// Failures (an IP now outside the new range, say) are logged and skipped.
async fn migrate_leases(old_engine: &DhcpEngine, new_engine: &DhcpEngine) {
    let active: Vec<_> = old_engine
        .pool()
        .active_leases()
        .await
        .into_iter()
        .filter(|lease| !lease.is_static)
        .collect();
    let total = active.len();
    let mut migrated = 0;

    for lease in active {
        match new_engine
            .pool()
            .request_ip(&lease.mac, Some(lease.ip), &lease.hostname)
            .await
        {
            Ok(_) => migrated += 1,
            Err(err) => {
                warn!(mac = %lease.mac, ip = %lease.ip, "lease migration failed: {err}");
            }
        }
    }

    info!("lease migration complete: {migrated}/{total}");
}

fn log_config_summary(config: &Config) {
    info!(
        "listening on {}:{} (api port {})",
        config.server.interface, config.server.port, config.server.api_port
    );
    info!(
        "pool range {} - {}, subnet {}",
        config.network.start_ip, config.network.end_ip, config.network.subnet
    );
    for gateway in &config.gateways {
        let marker = if gateway.is_default { " [default]" } else { "" };
        info!(
            "gateway {} ({}){}: {}",
            gateway.name, gateway.ip, marker, gateway.description
        );
    }
    info!(
        "{} reservations, {} devices, health check every {:?} via {:?}",
        config.bindings.len(),
        config.devices.len(),
        config.health_check.interval,
        config.health_check.method
    );
}
