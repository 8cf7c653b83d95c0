//! Gateway state
//!
//! One [`GatewayState`] exists per running gateway process. It owns the
//! active configuration snapshot and the network-transport auth token;
//! the provider map, capability maps, and session cache are each guarded
//! by their own locks elsewhere - no global lock spans subsystems.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use toolgate_core::ServerConfiguration;

pub struct GatewayState {
    /// Active configuration snapshot; replaced wholesale, never mutated
    configuration: RwLock<Arc<ServerConfiguration>>,
    /// Bearer token guarding network transports (absent in container mode)
    auth_token: parking_lot::RwLock<Option<String>>,
    healthy: AtomicBool,
}

impl GatewayState {
    pub fn new(configuration: ServerConfiguration) -> Self {
        Self {
            configuration: RwLock::new(Arc::new(configuration)),
            auth_token: parking_lot::RwLock::new(None),
            healthy: AtomicBool::new(false),
        }
    }

    /// Current configuration snapshot.
    pub async fn configuration(&self) -> Arc<ServerConfiguration> {
        Arc::clone(&*self.configuration.read().await)
    }

    /// Swap in a replacement snapshot (configuration watcher path).
    pub async fn replace_configuration(&self, configuration: ServerConfiguration) {
        info!(servers = configuration.len(), "[State] Configuration snapshot replaced");
        *self.configuration.write().await = Arc::new(configuration);
    }

    pub async fn server_has_oauth(&self, name: &str) -> bool {
        self.configuration.read().await.server_has_oauth(name)
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        match &token {
            Some(_) => info!("[State] Bearer token configured for network transport"),
            None => info!("[State] Bearer authentication disabled"),
        }
        *self.auth_token.write() = token;
    }

    pub fn auth_token(&self) -> Option<String> {
        self.auth_token.read().clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_swap_preserves_old_holders() {
        let initial: ServerConfiguration = serde_json::from_str(
            r#"{"servers": {"alpha": {"type": "stdio", "command": "alpha"}}}"#,
        )
        .unwrap();
        let state = GatewayState::new(initial);

        let held = state.configuration().await;
        state
            .replace_configuration(ServerConfiguration::new())
            .await;

        assert_eq!(held.len(), 1, "old snapshot unchanged");
        assert!(state.configuration().await.is_empty());
    }

    #[tokio::test]
    async fn test_server_has_oauth() {
        let config: ServerConfiguration = serde_json::from_str(
            r#"{"servers": {"notion": {"type": "remote", "url": "https://n.example.com/mcp",
                "oauth": {"provider": "notion"}}}}"#,
        )
        .unwrap();
        let state = GatewayState::new(config);

        assert!(state.server_has_oauth("notion").await);
        assert!(!state.server_has_oauth("ghost").await);
    }

    #[test]
    fn test_health_flag() {
        let state = GatewayState::new(ServerConfiguration::new());
        assert!(!state.is_healthy());
        state.set_healthy(true);
        assert!(state.is_healthy());
    }
}
