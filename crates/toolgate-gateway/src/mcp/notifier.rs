//! Capability change notifier
//!
//! Tracks connected peers by session and pushes `list_changed`
//! notifications when a backend's published capabilities change. Peers
//! register on session initialization and drop out when a notification
//! fails (the session is gone) or the session closes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rmcp::{service::Peer, RoleServer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::CapabilityChange;

/// Session → peer registry plus the consumer task feeding it
#[derive(Default)]
pub struct ChangeNotifier {
    peers: RwLock<HashMap<String, Arc<Peer<RoleServer>>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a peer for notification delivery.
    pub fn register_peer(&self, session_id: impl Into<String>, peer: Arc<Peer<RoleServer>>) {
        let session_id = session_id.into();
        debug!(session = %session_id, "[Notifier] Peer registered");
        self.peers.write().insert(session_id, peer);
    }

    /// Stop tracking a session's peer.
    pub fn unregister_peer(&self, session_id: &str) {
        if self.peers.write().remove(session_id).is_some() {
            debug!(session = %session_id, "[Notifier] Peer unregistered");
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Consume capability changes until the channel closes or the run
    /// scope is cancelled.
    pub fn start(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<CapabilityChange>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[Notifier] Listening for capability changes");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => self.broadcast(change).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "[Notifier] Lagged behind capability changes");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            info!("[Notifier] Stopped");
        })
    }

    async fn broadcast(&self, change: CapabilityChange) {
        let peers: Vec<(String, Arc<Peer<RoleServer>>)> = self
            .peers
            .read()
            .iter()
            .map(|(session, peer)| (session.clone(), Arc::clone(peer)))
            .collect();

        if peers.is_empty() {
            return;
        }

        debug!(
            server = %change.server,
            peers = peers.len(),
            tools = change.tools,
            prompts = change.prompts,
            resources = change.resources,
            "[Notifier] Broadcasting list_changed"
        );

        for (session, peer) in peers {
            let mut failed = false;
            if change.tools {
                failed |= peer.notify_tool_list_changed().await.is_err();
            }
            if change.prompts {
                failed |= peer.notify_prompt_list_changed().await.is_err();
            }
            if change.resources {
                failed |= peer.notify_resource_list_changed().await.is_err();
            }
            if failed {
                // Session is gone; drop the peer so we stop retrying it.
                debug!(session = %session, "[Notifier] Notification failed, dropping peer");
                self.unregister_peer(&session);
            }
        }
    }
}
