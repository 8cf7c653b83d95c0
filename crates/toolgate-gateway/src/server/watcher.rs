//! Configuration update watcher
//!
//! Consumes replacement snapshots from the configuration source. Each
//! update re-verifies images and re-runs capability registration; when
//! that fails, the previous configuration stays authoritative and the
//! watcher keeps running for the next update.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use toolgate_core::{RuntimeFlags, ServerConfiguration};
use toolgate_mcp::ClientPool;

use crate::capabilities::CapabilityRegistry;
use crate::images::ImageResolver;
use crate::metrics::MetricsRegistry;

use super::state::GatewayState;

pub struct WatcherDeps {
    pub state: Arc<GatewayState>,
    pub registry: Arc<CapabilityRegistry>,
    pub pool: Arc<ClientPool>,
    pub resolver: Arc<dyn ImageResolver>,
    pub metrics: Arc<MetricsRegistry>,
    pub flags: RuntimeFlags,
}

/// Spawn the watcher worker. Exits when the update stream closes or the
/// run scope is cancelled.
pub fn spawn_config_watcher(
    mut updates: mpsc::Receiver<ServerConfiguration>,
    deps: WatcherDeps,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("[Watcher] Configuration watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[Watcher] Run scope cancelled");
                    break;
                }
                update = updates.recv() => match update {
                    Some(new_config) => {
                        if let Err(e) = apply_update(&deps, new_config).await {
                            // No partial swap: the previous configuration
                            // remains in effect.
                            warn!("[Watcher] Update rejected, keeping previous configuration: {:#}", e);
                        }
                    }
                    None => {
                        debug!("[Watcher] Update stream closed");
                        break;
                    }
                }
            }
        }
        info!("[Watcher] Configuration watcher stopped");
    })
}

/// Verify and apply one replacement snapshot.
///
/// Image verification failure rejects the whole update. Per-server
/// discovery failures after the swap are logged only; that backend keeps
/// serving its previous capability set.
async fn apply_update(deps: &WatcherDeps, new_config: ServerConfiguration) -> anyhow::Result<()> {
    info!(servers = new_config.len(), "[Watcher] Applying configuration update");

    if !deps.flags.static_mode {
        verify_images(deps.resolver.as_ref(), &new_config).await?;
    }

    let old_config = deps.state.configuration().await;
    let removed: Vec<String> = old_config
        .names()
        .filter(|name| new_config.get(name).is_none())
        .map(String::from)
        .collect();

    deps.pool.apply_configuration(&new_config).await;
    deps.state.replace_configuration(new_config.clone()).await;

    for name in &removed {
        deps.registry.unpublish(name).await;
    }

    let reloads = new_config.names().map(|name| {
        let name = name.to_string();
        let registry = Arc::clone(&deps.registry);
        let metrics = Arc::clone(&deps.metrics);
        async move {
            metrics.record_capability_reload();
            if let Err(e) = registry.reload(&name).await {
                metrics.record_reload_failure();
                warn!(server = %name, "[Watcher] Reload failed, previous set stays active: {:#}", e);
            }
        }
    });
    futures::future::join_all(reloads).await;

    Ok(())
}

/// Verify every configured image; the first failure aborts the pass.
pub async fn verify_images(
    resolver: &dyn ImageResolver,
    config: &ServerConfiguration,
) -> anyhow::Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for (name, spec) in &config.servers {
        if let Some(image) = spec.image.as_deref() {
            if !seen.insert(image) {
                continue;
            }
            resolver
                .verify(name, image)
                .await
                .map_err(|e| anyhow::anyhow!("image '{}' for server '{}': {}", image, name, e))?;
        }
    }
    Ok(())
}
