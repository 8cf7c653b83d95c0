//! Container image resolution contract
//!
//! Backends run from container images; unless the gateway is started in
//! static mode, every configured image is resolved and verified before
//! first use. The actual pull/signature machinery lives behind this
//! contract in an external component.

use async_trait::async_trait;
use tracing::debug;

/// Resolves and verifies backend container images
#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// Verify the image backing `server_name` is present and trusted.
    async fn verify(&self, server_name: &str, image: &str) -> anyhow::Result<()>;

    /// In containerized self-hosting mode, the network name to attach
    /// sibling containers to. `None` when no discovery is needed.
    async fn discover_network(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Resolver for deployments where images are managed out of band
pub struct NoopImageResolver;

#[async_trait]
impl ImageResolver for NoopImageResolver {
    async fn verify(&self, server_name: &str, image: &str) -> anyhow::Result<()> {
        debug!(server = %server_name, image = %image, "[Images] Verification skipped (noop resolver)");
        Ok(())
    }
}
