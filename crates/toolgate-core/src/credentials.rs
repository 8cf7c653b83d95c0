//! Credential store and DCR registry contracts
//!
//! Token material itself never passes through the gateway core; it only
//! ever sees [`TokenStatus`] snapshots and app authorization state. The
//! concrete store (an external credential helper in production) keys
//! entries by `authorization-endpoint/provider-name`, both resolved from
//! the server's Dynamic Client Registration record.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{OAuthAppStatus, TokenStatus};
use crate::error::CredentialError;

/// Dynamic Client Registration record for one backend server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcrRecord {
    pub provider: String,
    pub authorization_endpoint: String,
    pub client_id: String,
}

impl DcrRecord {
    /// Key under which the external store files this server's credentials.
    pub fn credential_key(&self) -> String {
        format!(
            "{}/{}",
            self.authorization_endpoint.trim_end_matches('/'),
            self.provider
        )
    }
}

/// Lookup of DCR records by server name
#[async_trait]
pub trait DcrRegistry: Send + Sync {
    async fn record(&self, server_name: &str) -> Result<Option<DcrRecord>, CredentialError>;
}

/// Read access to per-server token state.
///
/// Implementations are external; the gateway only consumes this contract.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current health of the stored token for `server_name`.
    async fn token_status(&self, server_name: &str) -> Result<TokenStatus, CredentialError>;

    /// Authorization state of the OAuth app backing `server_name`.
    async fn oauth_app(&self, server_name: &str) -> Result<OAuthAppStatus, CredentialError>;
}

/// In-memory credential store.
///
/// Backs single-process deployments and tests; production deployments
/// plug in the external credential-helper-backed implementation instead.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, (TokenStatus, OAuthAppStatus)>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, server_name: impl Into<String>, status: TokenStatus, app: OAuthAppStatus) {
        self.entries
            .write()
            .await
            .insert(server_name.into(), (status, app));
    }

    pub async fn set_status(&self, server_name: &str, status: TokenStatus) {
        let mut entries = self.entries.write().await;
        match entries.get_mut(server_name) {
            Some(entry) => entry.0 = status,
            None => {
                entries.insert(
                    server_name.to_string(),
                    (status, OAuthAppStatus { authorized: true }),
                );
            }
        }
    }

    pub async fn remove(&self, server_name: &str) {
        self.entries.write().await.remove(server_name);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn token_status(&self, server_name: &str) -> Result<TokenStatus, CredentialError> {
        self.entries
            .read()
            .await
            .get(server_name)
            .map(|(status, _)| *status)
            .ok_or_else(|| CredentialError::NotFound(server_name.to_string()))
    }

    async fn oauth_app(&self, server_name: &str) -> Result<OAuthAppStatus, CredentialError> {
        self.entries
            .read()
            .await
            .get(server_name)
            .map(|(_, app)| *app)
            .ok_or_else(|| CredentialError::NotFound(server_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_credential_key() {
        let record = DcrRecord {
            provider: "notion".to_string(),
            authorization_endpoint: "https://auth.notion.com/".to_string(),
            client_id: "abc123".to_string(),
        };
        assert_eq!(record.credential_key(), "https://auth.notion.com/notion");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        let status = TokenStatus {
            valid: true,
            expires_at: Some(Utc::now()),
            needs_refresh: false,
        };
        store
            .insert("notion", status, OAuthAppStatus { authorized: true })
            .await;

        assert_eq!(store.token_status("notion").await.unwrap(), status);
        assert!(store.oauth_app("notion").await.unwrap().authorized);
    }

    #[tokio::test]
    async fn test_memory_store_missing_entry() {
        let store = MemoryCredentialStore::new();
        let err = store.token_status("ghost").await.unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(name) if name == "ghost"));
    }
}
