//! Core domain entities

pub mod config;
pub mod event;

pub use config::{
    LaunchSpec, OAuthSpec, RuntimeFlags, ServerConfiguration, ServerSpec, TransportMode,
};
pub use event::{AuthEvent, AuthEventKind, OAuthAppStatus, TokenStatus};
