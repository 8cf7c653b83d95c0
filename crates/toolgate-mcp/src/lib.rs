//! # ToolGate MCP Library
//!
//! Client-side MCP plumbing for the gateway:
//!
//! - `transports` - backend sessions over stdio child processes and
//!   streamable HTTP remotes
//! - `client_pool` - named backend handles with lazy connect and
//!   invalidation (forces reconnection after token rotation)

pub mod client_pool;
pub mod transports;

pub use client_pool::ClientPool;
pub use transports::{BackendCapabilities, BackendClientHandler, BackendSession};
