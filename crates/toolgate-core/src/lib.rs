//! # ToolGate Core Library
//!
//! Domain logic and external contracts for the ToolGate gateway.
//!
//! ## Modules
//!
//! - `domain` - Core entities (ServerConfiguration, AuthEvent, TokenStatus)
//! - `config_source` - Configuration sources (file-based, working-set-based)
//! - `credentials` - Credential store and DCR registry contracts
//! - `event_bus` - Authorization event distribution
//! - `error` - Typed contract errors

pub mod config_source;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod event_bus;

// Re-export commonly used types
pub use config_source::{ConfigHandle, ConfigSource, FileConfigSource, WorkingSetSource, WorkingSetStore};
pub use credentials::{CredentialStore, DcrRecord, DcrRegistry, MemoryCredentialStore};
pub use domain::*;
pub use error::{ConfigError, CredentialError};
pub use event_bus::{AuthEventBus, AuthEventReceiver, AuthEventSender};
