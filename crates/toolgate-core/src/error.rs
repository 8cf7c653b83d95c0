//! Typed errors for the core contracts

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by configuration sources
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no configuration files given")]
    NoFiles,

    #[error("working set '{0}' not found")]
    WorkingSetNotFound(String),

    #[error("working set store error: {0}")]
    WorkingSetStore(String),
}

/// Errors produced by the credential store
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential entry for server '{0}'")]
    NotFound(String),

    #[error("credential store error: {0}")]
    Store(String),
}
