//! Gateway orchestrator
//!
//! Top-level owner of the gateway process: wires configuration into
//! capability registration, starts the OAuth lifecycle workers, and
//! dispatches to the selected transport. `run` blocks for the process
//! lifetime or until the run scope is cancelled; every background worker
//! observes that scope and exits on its own.

pub mod auth;
pub mod state;
pub mod watcher;

pub use auth::{origin_allowed, transport_guard_middleware, TransportGuard};
pub use state::GatewayState;
pub use watcher::{spawn_config_watcher, verify_images, WatcherDeps};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::{routing::get, Router};
use rmcp::service::serve_server_with_ct;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use toolgate_core::{
    AuthEventBus, ConfigHandle, ConfigSource, CredentialStore, RuntimeFlags, TransportMode,
};
use toolgate_mcp::ClientPool;

use crate::capabilities::{CapabilityRegistry, PoolCapabilitySource};
use crate::images::ImageResolver;
use crate::mcp::{ChangeNotifier, GatewayHandler};
use crate::metrics::{start_flush_worker, MetricsRegistry};
use crate::middleware::{
    InterceptorChain, LoggingInterceptor, OAuthRefreshInterceptor, SecretBlockingInterceptor,
    TokenCoordinator, ToolInterceptor,
};
use crate::oauth::{NotificationRouter, ProviderRegistry, ReloadFn};
use crate::sessions::SessionCache;

/// Default port, matching the stock client configuration snippets
pub const DEFAULT_GATEWAY_PORT: u16 = 8811;

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportMode,
    pub flags: RuntimeFlags,
    /// Where the bearer token is persisted; `None` generates a fresh one
    /// per process
    pub auth_token_file: Option<PathBuf>,
    pub enable_cors: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_GATEWAY_PORT,
            transport: TransportMode::default(),
            flags: RuntimeFlags::default(),
            auth_token_file: None,
            enable_cors: true,
        }
    }
}

impl GatewayConfig {
    pub fn addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid address")
    }

    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

/// External collaborators, injected so the gateway stays testable and
/// environment-agnostic.
pub struct GatewayDependencies {
    pub config_source: Arc<dyn ConfigSource>,
    pub credentials: Arc<dyn CredentialStore>,
    pub coordinator: Arc<dyn TokenCoordinator>,
    pub resolver: Arc<dyn ImageResolver>,
    pub events: AuthEventBus,
    /// User-supplied interceptors, appended after the built-in chain
    pub interceptors: Vec<Arc<dyn ToolInterceptor>>,
}

/// The gateway process. One instance per process lifetime.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<GatewayState>,
    pool: Arc<ClientPool>,
    registry: Arc<CapabilityRegistry>,
    sessions: Arc<SessionCache>,
    providers: Arc<ProviderRegistry>,
    metrics: Arc<MetricsRegistry>,
    notifier: Arc<ChangeNotifier>,
    handler: GatewayHandler,
    credentials: Arc<dyn CredentialStore>,
    resolver: Arc<dyn ImageResolver>,
    events: AuthEventBus,
    listener: Mutex<Option<TcpListener>>,
    config_handle: Mutex<Option<ConfigHandle>>,
}

impl GatewayServer {
    /// Bind the listening socket, read the initial configuration, and
    /// wire up every subsystem. Startup failures here (socket, initial
    /// configuration) are the only errors that abort the whole process.
    pub async fn initialize(config: GatewayConfig, deps: GatewayDependencies) -> Result<Self> {
        // The socket opens before any other work so early client
        // connection attempts queue instead of being refused.
        let listener = if config.transport.is_network() {
            let addr = config.addr();
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Cannot bind listening socket {}", addr))?;
            info!(addr = %addr, "[Gateway] Listening socket bound");
            Some(listener)
        } else {
            None
        };

        let handle = deps
            .config_source
            .read()
            .await
            .context("Cannot read initial configuration")?;
        let initial = handle.configuration.clone();
        info!(servers = initial.len(), "[Gateway] Initial configuration loaded");

        let state = Arc::new(GatewayState::new(initial));
        let sessions = Arc::new(SessionCache::new());
        let pool = Arc::new(ClientPool::new());
        pool.apply_configuration(&*state.configuration().await).await;

        let registry = Arc::new(CapabilityRegistry::new(Arc::new(PoolCapabilitySource::new(
            Arc::clone(&pool),
        ))));
        let providers = Arc::new(ProviderRegistry::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let notifier = Arc::new(ChangeNotifier::new());

        let mut interceptors: Vec<Arc<dyn ToolInterceptor>> = vec![
            Arc::new(LoggingInterceptor::new(Arc::clone(&metrics))),
            Arc::new(SecretBlockingInterceptor),
            Arc::new(OAuthRefreshInterceptor::new(Arc::clone(&deps.coordinator))),
        ];
        interceptors.extend(deps.interceptors.iter().cloned());
        let chain = Arc::new(InterceptorChain::new(interceptors));

        let handler = GatewayHandler::new(
            registry.index(),
            Arc::clone(&pool),
            Arc::clone(&state),
            Arc::clone(&sessions),
            Arc::clone(&notifier),
            chain,
        );

        Ok(Self {
            config,
            state,
            pool,
            registry,
            sessions,
            providers,
            metrics,
            notifier,
            handler,
            credentials: deps.credentials,
            resolver: deps.resolver,
            events: deps.events,
            listener: Mutex::new(listener),
            config_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Re-entry point for other subsystems: recompute and republish one
    /// backend's capabilities.
    pub async fn refresh_capabilities(&self, server_name: &str) -> Result<()> {
        self.metrics.record_capability_reload();
        self.registry.reload(server_name).await
    }

    /// Reload callback handed to OAuth refresh workers. Invalidates the
    /// pooled client first so the reconnect picks up rotated credentials.
    fn reload_fn(&self) -> ReloadFn {
        let pool = Arc::clone(&self.pool);
        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);
        Arc::new(move |name| {
            let pool = Arc::clone(&pool);
            let registry = Arc::clone(&registry);
            let metrics = Arc::clone(&metrics);
            Box::pin(async move {
                pool.invalidate(&name).await;
                metrics.record_capability_reload();
                if let Err(e) = registry.reload(&name).await {
                    metrics.record_reload_failure();
                    warn!(server = %name, "[Gateway] Post-auth reload failed: {:#}", e);
                }
            })
        })
    }

    /// Run the gateway until the transport finishes or `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let flags = self.config.flags.clone();
        let initial = self.state.configuration().await;

        // Notification fan-out for capability changes
        Arc::clone(&self.notifier).start(self.registry.subscribe_changes(), cancel.child_token());

        // Image verification before first use. Startup keeps going on
        // failure; the affected backend simply fails to connect later.
        if !flags.static_mode {
            if let Err(e) = verify_images(self.resolver.as_ref(), &initial).await {
                warn!("[Gateway] Image verification failed: {:#}", e);
            }
            if flags.container_mode {
                match self.resolver.discover_network().await {
                    Ok(Some(network)) => {
                        info!(network = %network, "[Gateway] Discovered container network")
                    }
                    Ok(None) => {}
                    Err(e) => warn!("[Gateway] Container network discovery failed: {:#}", e),
                }
            }
        }

        // Initial capability registration, one pass per backend. Failures
        // are per-backend and never abort startup.
        let registrations = initial.names().map(|name| {
            let name = name.to_string();
            let server = Arc::clone(&self);
            async move {
                if let Err(e) = server.refresh_capabilities(&name).await {
                    server.metrics.record_reload_failure();
                    warn!(server = %name, "[Gateway] Initial registration failed: {:#}", e);
                }
            }
        });
        futures::future::join_all(registrations).await;

        // OAuth lifecycle workers: skipped inside containers, where the
        // host-side gateway owns authorization.
        if !flags.container_mode && flags.oauth_dcr {
            let router = Arc::new(NotificationRouter::new(
                Arc::clone(&self.providers),
                Arc::clone(&self.credentials),
                self.reload_fn(),
                cancel.child_token(),
            ));
            router.start_providers_for(&initial).await;
            Arc::clone(&router).start(self.events.subscribe());
        }

        // Configuration watcher, only when the source supports updates
        let mut handle = self
            .config_handle
            .lock()
            .await
            .take()
            .context("Gateway already ran")?;
        if let Some(updates) = handle.updates.take() {
            spawn_config_watcher(
                updates,
                WatcherDeps {
                    state: Arc::clone(&self.state),
                    registry: Arc::clone(&self.registry),
                    pool: Arc::clone(&self.pool),
                    resolver: Arc::clone(&self.resolver),
                    metrics: Arc::clone(&self.metrics),
                    flags: flags.clone(),
                },
                cancel.child_token(),
            );
        }

        start_flush_worker(
            Arc::clone(&self.metrics),
            flags.metrics_interval,
            flags.verbose_telemetry,
            cancel.child_token(),
        );

        self.state.set_healthy(true);

        let serve_result = match self.config.transport {
            TransportMode::Stdio => self.serve_stdio(cancel.clone()).await,
            mode => {
                // Bearer token for the network surface; container mode
                // skips authentication entirely.
                let token = if flags.container_mode {
                    None
                } else {
                    Some(match &self.config.auth_token_file {
                        Some(path) => auth::load_or_generate_token(path)
                            .context("Cannot read or persist the auth token")?,
                        None => auth::generate_auth_token(),
                    })
                };
                self.state.set_auth_token(token.clone());
                self.serve_http(mode, token, cancel.clone()).await
            }
        };

        // Teardown: stop the configuration watcher, drain sessions, and
        // let workers observe cancellation. Nothing is force-killed.
        self.state.set_healthy(false);
        handle.stop();
        self.providers.stop_all().await;
        self.sessions.drain();
        self.pool.shutdown().await;
        info!("[Gateway] Shut down");

        serve_result
    }

    /// Run in the background, returning the join handle.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn serve_stdio(&self, cancel: CancellationToken) -> Result<()> {
        // stdout is the protocol channel in this mode; diagnostics must
        // already be routed to stderr by the tracing setup.
        info!("[Gateway] Serving MCP on stdio");
        let transport = (tokio::io::stdin(), tokio::io::stdout());
        let service = serve_server_with_ct(self.handler.clone(), transport, cancel.child_token())
            .await
            .context("MCP handshake on stdio failed")?;
        service.waiting().await.context("stdio service task failed")?;
        Ok(())
    }

    async fn serve_http(
        &self,
        mode: TransportMode,
        token: Option<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .context("Listening socket already consumed")?;

        let handler = self.handler.clone();
        let service = StreamableHttpService::new(
            move || Ok(handler.clone()),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(Duration::from_secs(30)),
                sse_retry: Some(Duration::from_secs(3)),
                cancellation_token: cancel.child_token(),
            },
        );

        let router = build_router(mode, service, token, self.state(), self.config.enable_cors);

        info!(
            url = %self.config.base_url(),
            route = mode.route(),
            "[Gateway] Serving MCP over HTTP"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("HTTP server failed")?;
        Ok(())
    }
}

/// Assemble the HTTP surface: `/health` stays public, the protocol route
/// sits behind Origin validation and bearer authentication.
pub fn build_router<S>(
    mode: TransportMode,
    protocol_service: S,
    token: Option<String>,
    state: Arc<GatewayState>,
    enable_cors: bool,
) -> Router
where
    S: tower::Service<axum::http::Request<axum::body::Body>, Error = std::convert::Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Response: axum::response::IntoResponse,
    S::Future: Send + 'static,
{
    let guard = Arc::new(TransportGuard { token });

    let protected = Router::new()
        .nest_service(mode.route(), protocol_service)
        .layer(axum::middleware::from_fn_with_state(
            guard,
            transport_guard_middleware,
        ));

    let mut router = Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router
}

/// Liveness probe: never authenticated, 503 until the gateway serves.
async fn health(
    axum::extract::State(state): axum::extract::State<Arc<GatewayState>>,
) -> (axum::http::StatusCode, &'static str) {
    if state.is_healthy() {
        (axum::http::StatusCode::OK, "ok")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}
