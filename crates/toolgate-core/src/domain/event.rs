//! Authorization events and token snapshots
//!
//! External authorization flows (browser logins, token refreshes, logouts)
//! surface as [`AuthEvent`] values pushed through the notification source.
//! The gateway routes them to the matching per-server refresh worker; event
//! kinds it does not understand are accepted and intentionally dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of an externally-originated authorization event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthEventKind {
    LoginSuccess,
    TokenRefresh,
    LogoutSuccess,
    /// Anything else the notification source may emit; carried verbatim
    /// so logging stays useful, never acted upon.
    #[serde(untagged)]
    Other(String),
}

impl AuthEventKind {
    /// Events that mean the stored credential just changed, resetting the
    /// refresh worker's retry bookkeeping.
    pub fn is_credential_update(&self) -> bool {
        matches!(self, Self::LoginSuccess | Self::TokenRefresh)
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "login-success" => Self::LoginSuccess,
            "token-refresh" => Self::TokenRefresh,
            "logout-success" => Self::LogoutSuccess,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One authorization event for one provider/server name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEvent {
    #[serde(rename = "type")]
    pub kind: AuthEventKind,
    /// Server name the event concerns
    pub provider: String,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, provider: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
        }
    }
}

/// Transient snapshot of a stored token's health, fetched from the
/// credential store on each refresh-worker iteration. Never persisted by
/// the gateway itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStatus {
    pub valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub needs_refresh: bool,
}

impl TokenStatus {
    /// A token that is usable right now without coordinator involvement
    pub fn is_usable(&self) -> bool {
        self.valid && !self.needs_refresh
    }
}

/// Authorization state of the OAuth app backing a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthAppStatus {
    pub authorized: bool,
}
