//! ToolGate server binary
//!
//! Minimal serving entry point: reads flags from the environment, wires
//! a file-based configuration source, and runs the gateway until SIGINT.
//! The management command surface (login, catalog editing, client
//! configuration) lives in separate tooling.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolgate_core::{
    AuthEventBus, FileConfigSource, MemoryCredentialStore, RuntimeFlags, TransportMode,
};
use toolgate_gateway::{
    GatewayConfig, GatewayDependencies, GatewayServer, NoopImageResolver, TokenStatusCoordinator,
};

fn config_paths() -> Vec<PathBuf> {
    if let Ok(paths) = std::env::var("TOOLGATE_CONFIG") {
        return paths.split(':').map(PathBuf::from).collect();
    }
    let default = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgate")
        .join("config.json");
    vec![default]
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let flags = RuntimeFlags::from_env();
    let transport = std::env::var("TOOLGATE_TRANSPORT")
        .ok()
        .and_then(|v| TransportMode::parse(&v))
        .unwrap_or_default();

    // In stdio mode stdout is the protocol channel; diagnostics go to
    // stderr unconditionally so both modes behave the same.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let port = std::env::var("TOOLGATE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(toolgate_gateway::server::DEFAULT_GATEWAY_PORT);

    let config = GatewayConfig {
        port,
        transport,
        flags,
        auth_token_file: dirs::home_dir().map(|home| home.join(".toolgate").join("auth_token")),
        ..GatewayConfig::default()
    };

    let credentials = Arc::new(MemoryCredentialStore::new());
    let deps = GatewayDependencies {
        config_source: Arc::new(FileConfigSource::new(config_paths())),
        credentials: credentials.clone(),
        coordinator: Arc::new(TokenStatusCoordinator::new(credentials)),
        resolver: Arc::new(NoopImageResolver),
        events: AuthEventBus::new(),
        interceptors: Vec::new(),
    };

    let server = Arc::new(
        GatewayServer::initialize(config, deps)
            .await
            .context("Gateway startup failed")?,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[Gateway] Interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    server.run(cancel).await
}
