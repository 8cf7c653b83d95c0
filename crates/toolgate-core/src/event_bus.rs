//! Authorization event bus
//!
//! External authorization flows (login helpers, refresh daemons) push
//! [`AuthEvent`]s through this bus; the gateway's notification router is
//! the consumer. A broadcast channel lets diagnostics tooling subscribe
//! alongside the router without either seeing a partial stream.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::AuthEvent;

/// Default channel capacity for the event bus
const DEFAULT_CAPACITY: usize = 256;

/// Central hub for authorization event distribution
#[derive(Clone)]
pub struct AuthEventBus {
    sender: broadcast::Sender<AuthEvent>,
}

impl AuthEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Get a sender for emitting events.
    ///
    /// The sender can be cloned and shared across threads/tasks.
    pub fn sender(&self) -> AuthEventSender {
        AuthEventSender {
            sender: self.sender.clone(),
        }
    }

    /// Subscribe to receive events emitted after this call.
    pub fn subscribe(&self) -> AuthEventReceiver {
        AuthEventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for AuthEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Used by notification sources to emit authorization events
#[derive(Clone)]
pub struct AuthEventSender {
    sender: broadcast::Sender<AuthEvent>,
}

impl AuthEventSender {
    /// Emit an event, returning the number of receivers that saw it.
    /// Zero receivers is not an error; it just means no one is listening.
    pub fn emit(&self, event: AuthEvent) -> usize {
        let provider = event.provider.clone();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(provider = %provider, receivers = count, "[AuthEvents] Emitted event");
                count
            }
            Err(_) => {
                debug!(provider = %provider, "[AuthEvents] No receivers for event");
                0
            }
        }
    }
}

/// Used by the notification router to receive authorization events
pub struct AuthEventReceiver {
    receiver: broadcast::Receiver<AuthEvent>,
}

impl AuthEventReceiver {
    /// Receive the next event. Returns `None` once the channel is closed.
    /// Lag is logged and skipped over; the stream is unordered anyway.
    pub async fn recv(&mut self) -> Option<AuthEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        skipped_events = skipped,
                        "[AuthEvents] Receiver lagged, skipped {} events", skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("[AuthEvents] Channel closed");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuthEventKind;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = AuthEventBus::new();
        let sender = bus.sender();
        let mut receiver = bus.subscribe();

        sender.emit(AuthEvent::new(AuthEventKind::LoginSuccess, "notion"));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.kind, AuthEventKind::LoginSuccess);
        assert_eq!(event.provider, "notion");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = AuthEventBus::new();
        let sender = bus.sender();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        sender.emit(AuthEvent::new(AuthEventKind::TokenRefresh, "github"));

        assert_eq!(rx1.recv().await.unwrap().provider, "github");
        assert_eq!(rx2.recv().await.unwrap().provider, "github");
    }

    #[test]
    fn test_no_receivers() {
        let bus = AuthEventBus::new();
        let sender = bus.sender();

        // Should not panic, just report zero receivers
        let count = sender.emit(AuthEvent::new(AuthEventKind::LogoutSuccess, "slack"));
        assert_eq!(count, 0);
    }
}
