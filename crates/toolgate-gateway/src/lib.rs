//! ToolGate Gateway
//!
//! MCP proxy server that provides:
//! - Transport multiplexing (stdio, SSE, streamable HTTP)
//! - Capability aggregation with hot-reload across backend servers
//! - OAuth token lifecycle management for remote backends
//! - Tool-call interception (logging, secret blocking, token refresh)
//! - Bearer-token and Origin protection on the network surface

pub mod capabilities;
pub mod images;
pub mod mcp;
pub mod metrics;
pub mod middleware;
pub mod oauth;
pub mod server;
pub mod sessions;

pub use capabilities::{CapabilityChange, CapabilityRegistry, CapabilitySet, CapabilitySource};
pub use images::{ImageResolver, NoopImageResolver};
pub use mcp::{ChangeNotifier, GatewayHandler};
pub use metrics::MetricsRegistry;
pub use middleware::{
    InterceptorChain, LoggingInterceptor, OAuthRefreshInterceptor, SecretBlockingInterceptor,
    TokenCoordinator, TokenStatusCoordinator, ToolCallContext, ToolInterceptor,
};
pub use oauth::{NotificationRouter, Provider, ProviderRegistry, ReloadFn};
pub use server::{GatewayConfig, GatewayDependencies, GatewayServer, GatewayState};
pub use sessions::SessionCache;
