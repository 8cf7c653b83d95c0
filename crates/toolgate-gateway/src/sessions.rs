//! Per-session cached client data
//!
//! Each connected client session may declare filesystem roots; the cache
//! keeps the last list exchanged so backends can be answered without a
//! round-trip to the client. Entries appear lazily on the first
//! root-listing exchange and go away when the session closes (or when the
//! cache is drained at shutdown).

use std::time::Instant;

use dashmap::DashMap;
use rmcp::model::Root;
use tracing::debug;

/// Cached root list for one session
#[derive(Debug, Clone)]
pub struct CachedRoots {
    pub roots: Vec<Root>,
    pub cached_at: Instant,
}

/// Session-keyed cache of client-declared data
#[derive(Default)]
pub struct SessionCache {
    entries: DashMap<String, CachedRoots>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roots(&self, session_id: &str) -> Option<Vec<Root>> {
        self.entries.get(session_id).map(|e| e.roots.clone())
    }

    pub fn store_roots(&self, session_id: impl Into<String>, roots: Vec<Root>) {
        let session_id = session_id.into();
        debug!(session = %session_id, roots = roots.len(), "[Sessions] Cached roots");
        self.entries.insert(
            session_id,
            CachedRoots {
                roots,
                cached_at: Instant::now(),
            },
        );
    }

    /// Remove one session's entry (session closed).
    pub fn remove(&self, session_id: &str) {
        if self.entries.remove(session_id).is_some() {
            debug!(session = %session_id, "[Sessions] Removed session entry");
        }
    }

    /// Drop every entry (shutdown path).
    pub fn drain(&self) {
        let count = self.entries.len();
        self.entries.clear();
        if count > 0 {
            debug!(sessions = count, "[Sessions] Drained session cache");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
