//! OAuth refresh interceptor
//!
//! Blocks a tool invocation until its backend's token is known-valid.
//! The heavy lifting - at-most-one concurrent refresh per backend,
//! waiting for token persistence and capability reload - belongs to the
//! external coordinator; this interceptor only consumes its contract.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::CallToolResult;
use tracing::{debug, warn};

use toolgate_core::CredentialStore;

use super::{error_result, ToolCallContext, ToolInterceptor};

/// External component guaranteeing at-most-one concurrent token refresh
/// per backend. `ensure_valid_token` returns once the token is usable and
/// any dependent capability reload has completed.
#[async_trait]
pub trait TokenCoordinator: Send + Sync {
    async fn ensure_valid_token(&self, server_name: &str) -> anyhow::Result<()>;
}

/// Request-path middleware wrapping every tool invocation
pub struct OAuthRefreshInterceptor {
    coordinator: Arc<dyn TokenCoordinator>,
}

impl OAuthRefreshInterceptor {
    pub fn new(coordinator: Arc<dyn TokenCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ToolInterceptor for OAuthRefreshInterceptor {
    async fn before(&self, ctx: &ToolCallContext) -> Option<CallToolResult> {
        // Fast path: no backend association, or a backend without OAuth
        let Some(server) = ctx.server_name.as_deref() else {
            return None;
        };
        if !ctx.server_has_oauth {
            return None;
        }

        match self.coordinator.ensure_valid_token(server).await {
            Ok(()) => {
                debug!(server = %server, "[OAuthRefresh] Token valid, call proceeds");
                None
            }
            Err(e) => {
                warn!(server = %server, "[OAuthRefresh] Token validation failed: {:#}", e);
                Some(error_result(format!(
                    "Could not refresh the authorization for server '{server}': {e}. \
                     Run `toolgate login {server}` to re-authorize, then retry."
                )))
            }
        }
    }
}

/// Minimal coordinator that trusts the credential store's own snapshot.
///
/// Suitable when an external refresh daemon keeps tokens fresh; a full
/// coordinator that performs the refresh itself replaces this in
/// production wiring.
pub struct TokenStatusCoordinator {
    credentials: Arc<dyn CredentialStore>,
}

impl TokenStatusCoordinator {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl TokenCoordinator for TokenStatusCoordinator {
    async fn ensure_valid_token(&self, server_name: &str) -> anyhow::Result<()> {
        let status = self.credentials.token_status(server_name).await?;
        if status.is_usable() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("stored token is expired or pending refresh"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{text_result, InterceptorChain};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCoordinator {
        ok: bool,
        calls: AtomicUsize,
    }

    impl ScriptedCoordinator {
        fn new(ok: bool) -> Arc<Self> {
            Arc::new(Self {
                ok,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TokenCoordinator for ScriptedCoordinator {
        async fn ensure_valid_token(&self, _server_name: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("refresh timed out"))
            }
        }
    }

    fn chain(coordinator: Arc<ScriptedCoordinator>) -> InterceptorChain {
        InterceptorChain::new(vec![Arc::new(OAuthRefreshInterceptor::new(coordinator))])
    }

    #[tokio::test]
    async fn test_no_backend_association_passes_through() {
        let coordinator = ScriptedCoordinator::new(false);
        let result = chain(coordinator.clone())
            .run(ToolCallContext::new("builtin"), |_| async { text_result("ok") })
            .await;

        assert_eq!(result.is_error, Some(false));
        assert_eq!(coordinator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_without_oauth_passes_through() {
        let coordinator = ScriptedCoordinator::new(false);
        let ctx = ToolCallContext::new("fetch").with_server("fetch", false);
        let result = chain(coordinator.clone())
            .run(ctx, |_| async { text_result("ok") })
            .await;

        assert_eq!(result.is_error, Some(false));
        assert_eq!(coordinator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_token_proceeds() {
        let coordinator = ScriptedCoordinator::new(true);
        let ctx = ToolCallContext::new("search").with_server("notion", true);
        let result = chain(coordinator.clone())
            .run(ctx, |_| async { text_result("ok") })
            .await;

        assert_eq!(result.is_error, Some(false));
        assert_eq!(coordinator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_short_circuits_with_remediation() {
        let coordinator = ScriptedCoordinator::new(false);
        let ctx = ToolCallContext::new("search").with_server("notion", true);
        let result = chain(coordinator)
            .run(ctx, |_| async { panic!("dispatch must not run") })
            .await;

        assert_eq!(result.is_error, Some(true));
        let text = serde_json::to_string(&result.content).unwrap();
        assert!(text.contains("notion"), "message names the failing server");
        assert!(text.contains("toolgate login"), "message gives the remediation command");
    }

    #[tokio::test]
    async fn test_status_coordinator_consults_store() {
        use toolgate_core::{MemoryCredentialStore, OAuthAppStatus, TokenStatus};

        let store = Arc::new(MemoryCredentialStore::new());
        store
            .insert(
                "notion",
                TokenStatus {
                    valid: true,
                    expires_at: None,
                    needs_refresh: false,
                },
                OAuthAppStatus { authorized: true },
            )
            .await;

        let coordinator = TokenStatusCoordinator::new(store.clone());
        assert!(coordinator.ensure_valid_token("notion").await.is_ok());

        store
            .set_status(
                "notion",
                TokenStatus {
                    valid: false,
                    expires_at: None,
                    needs_refresh: true,
                },
            )
            .await;
        assert!(coordinator.ensure_valid_token("notion").await.is_err());
    }
}
