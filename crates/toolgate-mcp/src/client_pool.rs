//! MCP client pool
//!
//! Named backend handles, connected lazily on first use and reused until
//! invalidated. Invalidation (e.g. after an OAuth token rotation) drops
//! the live session so the next call reconnects with fresh credentials.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use toolgate_core::{LaunchSpec, ServerConfiguration};

use crate::transports::BackendSession;

/// Pool of backend sessions keyed by server name
pub struct ClientPool {
    /// Launch specs from the active configuration snapshot
    specs: RwLock<HashMap<String, LaunchSpec>>,
    /// Live sessions
    sessions: RwLock<HashMap<String, Arc<BackendSession>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self {
            specs: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the pool's view of the configuration.
    ///
    /// Sessions for servers no longer configured are dropped; surviving
    /// servers whose launch spec changed are invalidated so the next call
    /// reconnects with the new spec.
    pub async fn apply_configuration(&self, config: &ServerConfiguration) {
        let mut new_specs: HashMap<String, LaunchSpec> = HashMap::new();
        for (name, spec) in &config.servers {
            new_specs.insert(name.clone(), spec.launch.clone());
        }

        let stale: Vec<(String, Arc<BackendSession>)> = {
            let old_specs = self.specs.read().await;
            let mut sessions = self.sessions.write().await;
            let mut stale = Vec::new();
            sessions.retain(|name, session| {
                let keep = new_specs.get(name) == old_specs.get(name) && new_specs.contains_key(name);
                if !keep {
                    stale.push((name.clone(), Arc::clone(session)));
                }
                keep
            });
            stale
        };

        for (name, session) in stale {
            debug!(server = %name, "[Pool] Dropping session for removed/changed server");
            disconnect_if_idle(name, session).await;
        }

        *self.specs.write().await = new_specs;
    }

    /// Get a handle for the named backend, connecting if necessary.
    pub async fn handle(&self, name: &str) -> Result<Arc<BackendSession>> {
        if let Some(session) = self.sessions.read().await.get(name) {
            debug!(server = %name, "[Pool] Reusing pooled session");
            return Ok(Arc::clone(session));
        }

        let launch = self
            .specs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Server not configured: {}", name))?;

        info!(server = %name, "[Pool] Connecting new session");
        let session = Arc::new(BackendSession::connect(name, &launch).await?);

        let mut sessions = self.sessions.write().await;
        // Another caller may have connected while we were; reuse theirs.
        if let Some(existing) = sessions.get(name) {
            debug!(server = %name, "[Pool] Lost connect race, reusing winner");
            return Ok(Arc::clone(existing));
        }
        sessions.insert(name.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Drop the named backend's session so the next call reconnects.
    pub async fn invalidate(&self, name: &str) {
        let removed = self.sessions.write().await.remove(name);
        match removed {
            Some(session) => {
                info!(server = %name, "[Pool] Invalidated session");
                disconnect_if_idle(name.to_string(), session).await;
            }
            None => debug!(server = %name, "[Pool] Nothing to invalidate"),
        }
    }

    /// Whether a live session exists for the named backend.
    pub async fn is_connected(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    /// Disconnect every session (shutdown path).
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<BackendSession>)> =
            self.sessions.write().await.drain().collect();
        for (name, session) in drained {
            disconnect_if_idle(name, session).await;
        }
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Gracefully close a session if no caller still holds it; in-flight
/// holders finish their call and the transport cleans up on drop.
async fn disconnect_if_idle(name: String, session: Arc<BackendSession>) {
    match Arc::try_unwrap(session) {
        Ok(session) => {
            if let Err(e) = session.disconnect().await {
                warn!(server = %name, "[Pool] Disconnect failed: {}", e);
            }
        }
        Err(_) => debug!(server = %name, "[Pool] Session still in use, dropping when idle"),
    }
}
