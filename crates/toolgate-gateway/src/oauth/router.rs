//! OAuth notification router
//!
//! Bridges the external, unordered stream of authorization events into
//! targeted provider lifecycle actions. The router holds no state of its
//! own beyond the provider registry it shares with the orchestrator, and
//! it never touches tokens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use toolgate_core::{
    AuthEvent, AuthEventKind, AuthEventReceiver, CredentialStore, ServerConfiguration,
};

use super::provider::{Provider, ReloadFn};

/// Delay between spawning a provider and forwarding its first event, so
/// the new worker reaches its wait point before the inbox fires.
const PROVIDER_STARTUP_GRACE: Duration = Duration::from_millis(100);

/// Name → provider map. One lock guards the whole map; at most one live
/// provider per name is enforced here, not inside the provider.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Mutex<HashMap<String, Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a provider built by `spawn` unless one already exists.
    /// Returns whether a new provider was created.
    pub async fn ensure(&self, name: &str, spawn: impl FnOnce() -> Provider) -> bool {
        let mut providers = self.providers.lock().await;
        if providers.contains_key(name) {
            false
        } else {
            providers.insert(name.to_string(), spawn());
            true
        }
    }

    /// Forward an event to the named provider's inbox, if one exists.
    pub async fn notify(&self, name: &str, event: AuthEvent) -> bool {
        // Clone the inbox sender out of the lock; the send itself must
        // not hold the map lock across an await on a full inbox.
        let provider_inbox = {
            let providers = self.providers.lock().await;
            providers.get(name).map(|p| p.inbox_sender())
        };
        match provider_inbox {
            Some(inbox) => {
                if inbox.send(event).await.is_err() {
                    debug!(server = %name, "[OAuthRouter] Provider inbox closed");
                }
                true
            }
            None => false,
        }
    }

    /// Stop and remove the named provider, if any.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.providers.lock().await.remove(name);
        match removed {
            Some(provider) => {
                provider.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every provider (shutdown path); workers observe their stop
    /// signals and exit on their own.
    pub async fn stop_all(&self) {
        let providers = self.providers.lock().await;
        for provider in providers.values() {
            provider.stop();
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.providers.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.providers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.lock().await.is_empty()
    }
}

/// Dispatches authorization events to providers, creating and destroying
/// them as logins and logouts arrive.
pub struct NotificationRouter {
    providers: Arc<ProviderRegistry>,
    credentials: Arc<dyn CredentialStore>,
    reload: ReloadFn,
    cancel: CancellationToken,
}

impl NotificationRouter {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        credentials: Arc<dyn CredentialStore>,
        reload: ReloadFn,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            providers,
            credentials,
            reload,
            cancel,
        }
    }

    /// Start one provider per backend that is remote, OAuth-capable, and
    /// already authorized (gateway startup pass).
    pub async fn start_providers_for(&self, config: &ServerConfiguration) {
        for name in config.remote_oauth_servers() {
            let authorized = match self.credentials.oauth_app(name).await {
                Ok(app) => app.authorized,
                Err(e) => {
                    debug!(server = %name, "[OAuthRouter] No app status, skipping provider: {}", e);
                    continue;
                }
            };
            if !authorized {
                debug!(server = %name, "[OAuthRouter] Not authorized yet, no provider");
                continue;
            }

            let created = self
                .providers
                .ensure(name, || self.spawn_provider(name))
                .await;
            if created {
                info!(server = %name, "[OAuthRouter] Started provider for authorized server");
            }
        }
    }

    /// Consume the event stream until it closes or the run scope ends.
    pub fn start(self: Arc<Self>, mut events: AuthEventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[OAuthRouter] Listening for authorization events");
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("[OAuthRouter] Run scope cancelled");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(event) => self.dispatch(event).await,
                        None => {
                            debug!("[OAuthRouter] Event stream closed");
                            break;
                        }
                    }
                }
            }
            info!("[OAuthRouter] Stopped");
        })
    }

    async fn dispatch(&self, event: AuthEvent) {
        let name = event.provider.clone();
        match event.kind {
            AuthEventKind::LoginSuccess => {
                let created = self
                    .providers
                    .ensure(&name, || self.spawn_provider(&name))
                    .await;
                if created {
                    info!(server = %name, "[OAuthRouter] Login created provider");
                    tokio::time::sleep(PROVIDER_STARTUP_GRACE).await;
                }
                self.providers.notify(&name, event).await;
            }
            AuthEventKind::TokenRefresh => {
                if !self.providers.notify(&name, event).await {
                    // No provider means no server currently cares, e.g. a
                    // stale notification from a disabled server.
                    debug!(server = %name, "[OAuthRouter] Dropping refresh event, no provider");
                }
            }
            AuthEventKind::LogoutSuccess => {
                if self.providers.remove(&name).await {
                    info!(server = %name, "[OAuthRouter] Logout stopped provider");
                } else {
                    debug!(server = %name, "[OAuthRouter] Logout for unknown provider");
                }
            }
            AuthEventKind::Other(ref kind) => {
                trace!(server = %name, kind = %kind, "[OAuthRouter] Ignoring event kind");
            }
        }
    }

    fn spawn_provider(&self, name: &str) -> Provider {
        Provider::spawn(
            name,
            Arc::clone(&self.credentials),
            Arc::clone(&self.reload),
            self.cancel.child_token(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use toolgate_core::{AuthEventBus, MemoryCredentialStore, OAuthAppStatus, TokenStatus};

    fn far_future_status() -> TokenStatus {
        TokenStatus {
            valid: true,
            expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(12)),
            needs_refresh: false,
        }
    }

    fn counting_reload(counter: Arc<AtomicU32>) -> ReloadFn {
        Arc::new(move |_name| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    async fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    struct Fixture {
        bus: AuthEventBus,
        providers: Arc<ProviderRegistry>,
        reloads: Arc<AtomicU32>,
        cancel: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .insert("github", far_future_status(), OAuthAppStatus { authorized: true })
            .await;

        let providers = Arc::new(ProviderRegistry::new());
        let reloads = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let bus = AuthEventBus::new();

        let router = Arc::new(NotificationRouter::new(
            Arc::clone(&providers),
            store.clone(),
            counting_reload(Arc::clone(&reloads)),
            cancel.clone(),
        ));
        router.start(bus.subscribe());

        Fixture {
            bus,
            providers,
            reloads,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_login_creates_provider_and_triggers_one_reload() {
        let fx = fixture().await;
        let sender = fx.bus.sender();

        sender.emit(AuthEvent::new(AuthEventKind::LoginSuccess, "github"));

        let reloads = Arc::clone(&fx.reloads);
        wait_for(move || reloads.load(Ordering::SeqCst) == 1).await;
        assert!(fx.providers.contains("github").await);
        assert_eq!(fx.providers.len().await, 1);

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_second_login_does_not_duplicate_provider() {
        let fx = fixture().await;
        let sender = fx.bus.sender();

        sender.emit(AuthEvent::new(AuthEventKind::LoginSuccess, "github"));
        sender.emit(AuthEvent::new(AuthEventKind::LoginSuccess, "github"));

        let reloads = Arc::clone(&fx.reloads);
        wait_for(move || reloads.load(Ordering::SeqCst) == 2).await;
        assert_eq!(fx.providers.len().await, 1);

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_logout_removes_provider_and_refresh_is_dropped() {
        let fx = fixture().await;
        let sender = fx.bus.sender();

        sender.emit(AuthEvent::new(AuthEventKind::LoginSuccess, "github"));
        let reloads = Arc::clone(&fx.reloads);
        wait_for(move || reloads.load(Ordering::SeqCst) == 1).await;

        sender.emit(AuthEvent::new(AuthEventKind::LogoutSuccess, "github"));
        for _ in 0..500 {
            if !fx.providers.contains("github").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!fx.providers.contains("github").await, "logout removes the provider");

        // A refresh for the logged-out server goes nowhere
        sender.emit(AuthEvent::new(AuthEventKind::TokenRefresh, "github"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.reloads.load(Ordering::SeqCst), 1, "no reload after logout");

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_refresh_without_provider_is_dropped() {
        let fx = fixture().await;
        let sender = fx.bus.sender();

        sender.emit(AuthEvent::new(AuthEventKind::TokenRefresh, "github"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fx.providers.is_empty().await);
        assert_eq!(fx.reloads.load(Ordering::SeqCst), 0);

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_event_kinds_are_ignored() {
        let fx = fixture().await;
        let sender = fx.bus.sender();

        sender.emit(AuthEvent::new(
            AuthEventKind::Other("password-changed".to_string()),
            "github",
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fx.providers.is_empty().await);

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_startup_pass_spawns_only_authorized_servers() {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .insert("github", far_future_status(), OAuthAppStatus { authorized: true })
            .await;
        store
            .insert("notion", far_future_status(), OAuthAppStatus { authorized: false })
            .await;

        let providers = Arc::new(ProviderRegistry::new());
        let cancel = CancellationToken::new();
        let router = NotificationRouter::new(
            Arc::clone(&providers),
            store,
            counting_reload(Arc::new(AtomicU32::new(0))),
            cancel.clone(),
        );

        let config: ServerConfiguration = serde_json::from_str(
            r#"{"servers": {
                "github": {"type": "remote", "url": "https://gh.example.com/mcp",
                           "oauth": {"provider": "github"}},
                "notion": {"type": "remote", "url": "https://no.example.com/mcp",
                           "oauth": {"provider": "notion"}},
                "local":  {"type": "stdio", "command": "local-server",
                           "oauth": {"provider": "local"}}
            }}"#,
        )
        .unwrap();

        router.start_providers_for(&config).await;

        assert!(providers.contains("github").await);
        assert!(!providers.contains("notion").await, "unauthorized server gets no provider");
        assert!(!providers.contains("local").await, "stdio server gets no provider");

        cancel.cancel();
    }
}
