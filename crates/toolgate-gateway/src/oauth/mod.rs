//! OAuth token lifecycle management
//!
//! One refresh worker ([`Provider`]) runs per authorized remote-OAuth
//! backend, polling token status on a dynamic schedule. The
//! [`NotificationRouter`] bridges external authorization events into
//! worker lifecycle actions (create on login, forward refreshes, destroy
//! on logout).

mod provider;
mod router;

pub use provider::{Provider, ReloadFn, EXPIRY_SLACK, MAX_REFRESH_RETRIES, REFRESH_BACKOFF_BASE};
pub use router::{NotificationRouter, ProviderRegistry};
