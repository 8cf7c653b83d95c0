//! Capability registry and hot-reload
//!
//! Keeps the protocol server's advertised tool/prompt/resource set
//! consistent with what each live backend actually exposes. A reload
//! replaces the backend's whole capability set - never merges - and the
//! published index is only ever touched inside one write critical
//! section, so no client request can observe an empty or doubled set
//! mid-reload.
//!
//! Locking:
//! - one `Mutex` guards the per-server set map (all names)
//! - a per-name guard serializes reloads of the same backend; different
//!   backends reload concurrently
//! - the published index has its own `RwLock`, written only while the
//!   set map lock is held

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rmcp::model::{Prompt, Resource, ResourceTemplate, Tool};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use toolgate_mcp::{BackendCapabilities, ClientPool};

/// The set of capabilities registered for one backend server
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
}

impl CapabilitySet {
    /// Stable identifiers for everything in this set, one namespace per kind
    fn identifiers(&self) -> HashSet<String> {
        let mut ids = HashSet::new();
        ids.extend(self.tools.iter().map(|t| format!("tool:{}", t.name)));
        ids.extend(self.prompts.iter().map(|p| format!("prompt:{}", p.name)));
        ids.extend(self.resources.iter().map(|r| format!("resource:{}", r.uri)));
        ids.extend(
            self.resource_templates
                .iter()
                .map(|t| format!("template:{}", t.uri_template)),
        );
        ids
    }

    pub fn total_count(&self) -> usize {
        self.tools.len()
            + self.prompts.len()
            + self.resources.len()
            + self.resource_templates.len()
    }
}

impl From<BackendCapabilities> for CapabilitySet {
    fn from(caps: BackendCapabilities) -> Self {
        Self {
            tools: caps.tools,
            prompts: caps.prompts,
            resources: caps.resources,
            resource_templates: caps.resource_templates,
        }
    }
}

/// Which capability kinds changed for a backend during a reload
#[derive(Debug, Clone)]
pub struct CapabilityChange {
    pub server: String,
    pub tools: bool,
    pub prompts: bool,
    pub resources: bool,
}

impl CapabilityChange {
    fn any(&self) -> bool {
        self.tools || self.prompts || self.resources
    }
}

/// Compute the identifier diff between two capability sets
fn diff_identifiers(old: &CapabilitySet, new: &CapabilitySet) -> (Vec<String>, Vec<String>) {
    let old_ids = old.identifiers();
    let new_ids = new.identifiers();

    let added = new_ids.difference(&old_ids).cloned().collect();
    let removed = old_ids.difference(&new_ids).cloned().collect();
    (added, removed)
}

/// What the protocol handler serves: identifier → owning server + definition
#[derive(Default)]
pub struct PublishedIndex {
    tools: HashMap<String, (String, Tool)>,
    prompts: HashMap<String, (String, Prompt)>,
    resources: HashMap<String, (String, Resource)>,
    templates: HashMap<String, (String, ResourceTemplate)>,
}

impl PublishedIndex {
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.values().map(|(_, t)| t.clone()).collect()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.values().map(|(_, p)| p.clone()).collect()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.resources.values().map(|(_, r)| r.clone()).collect()
    }

    pub fn resource_templates(&self) -> Vec<ResourceTemplate> {
        self.templates.values().map(|(_, t)| t.clone()).collect()
    }

    /// Which backend owns the named tool
    pub fn server_for_tool(&self, name: &str) -> Option<String> {
        self.tools.get(name).map(|(server, _)| server.clone())
    }

    pub fn server_for_prompt(&self, name: &str) -> Option<String> {
        self.prompts.get(name).map(|(server, _)| server.clone())
    }

    pub fn server_for_resource(&self, uri: &str) -> Option<String> {
        self.resources.get(uri).map(|(server, _)| server.clone())
    }

    /// Drop every entry owned by `server`
    fn remove_server(&mut self, server: &str) {
        self.tools.retain(|_, (owner, _)| owner != server);
        self.prompts.retain(|_, (owner, _)| owner != server);
        self.resources.retain(|_, (owner, _)| owner != server);
        self.templates.retain(|_, (owner, _)| owner != server);
    }

    /// Publish one server's set. Identifiers already owned by a different
    /// server are skipped: first registration wins, shadowing an
    /// already-published identifier would silently reroute client calls.
    fn publish(&mut self, server: &str, set: &CapabilitySet) {
        for tool in &set.tools {
            let name = tool.name.to_string();
            match self.tools.get(&name) {
                Some((owner, _)) if owner != server => {
                    warn!(
                        server = %server,
                        tool = %name,
                        owner = %owner,
                        "[Capabilities] Tool name collision, keeping first registration"
                    );
                }
                _ => {
                    self.tools.insert(name, (server.to_string(), tool.clone()));
                }
            }
        }
        for prompt in &set.prompts {
            let name = prompt.name.to_string();
            match self.prompts.get(&name) {
                Some((owner, _)) if owner != server => {
                    warn!(
                        server = %server,
                        prompt = %name,
                        owner = %owner,
                        "[Capabilities] Prompt name collision, keeping first registration"
                    );
                }
                _ => {
                    self.prompts.insert(name, (server.to_string(), prompt.clone()));
                }
            }
        }
        for resource in &set.resources {
            self.resources
                .insert(resource.uri.to_string(), (server.to_string(), resource.clone()));
        }
        for template in &set.resource_templates {
            self.templates.insert(
                template.uri_template.to_string(),
                (server.to_string(), template.clone()),
            );
        }
    }
}

/// Source of freshly-discovered backend capabilities
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    async fn discover(&self, server_name: &str) -> Result<CapabilitySet>;
}

/// Discovery through the client pool (production path)
pub struct PoolCapabilitySource {
    pool: Arc<ClientPool>,
}

impl PoolCapabilitySource {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CapabilitySource for PoolCapabilitySource {
    async fn discover(&self, server_name: &str) -> Result<CapabilitySet> {
        let session = self
            .pool
            .handle(server_name)
            .await
            .context("Failed to reach backend")?;
        let discovered = session.discover().await.context("Capability discovery failed")?;
        Ok(discovered.into())
    }
}

/// Per-backend record of currently-published capabilities
pub struct CapabilityRegistry {
    source: Arc<dyn CapabilitySource>,
    /// One lock for the whole set map
    sets: Mutex<HashMap<String, CapabilitySet>>,
    /// Serializes reloads per server name
    reload_guards: DashMap<String, Arc<Mutex<()>>>,
    index: Arc<RwLock<PublishedIndex>>,
    changes: broadcast::Sender<CapabilityChange>,
}

impl CapabilityRegistry {
    pub fn new(source: Arc<dyn CapabilitySource>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            source,
            sets: Mutex::new(HashMap::new()),
            reload_guards: DashMap::new(),
            index: Arc::new(RwLock::new(PublishedIndex::default())),
            changes,
        }
    }

    /// The index the protocol handler serves from
    pub fn index(&self) -> Arc<RwLock<PublishedIndex>> {
        Arc::clone(&self.index)
    }

    /// Subscribe to post-reload change notifications
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CapabilityChange> {
        self.changes.subscribe()
    }

    fn reload_guard(&self, name: &str) -> Arc<Mutex<()>> {
        self.reload_guards
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Re-discover one backend's capabilities and republish them.
    ///
    /// On discovery failure the previously-registered set stays untouched:
    /// stale-but-working beats broken.
    pub async fn reload(&self, name: &str) -> Result<()> {
        let guard = self.reload_guard(name);
        let _serialized = guard.lock().await;

        // Discovery runs before any capability lock is taken; a slow
        // backend must not block reloads of other servers.
        let new_set = match self.source.discover(name).await {
            Ok(set) => set,
            Err(e) => {
                warn!(
                    server = %name,
                    "[Capabilities] Discovery failed, keeping previous set: {:#}",
                    e
                );
                return Err(e);
            }
        };

        let mut sets = self.sets.lock().await;
        let old_set = sets.get(name).cloned().unwrap_or_default();
        let (added, removed) = diff_identifiers(&old_set, &new_set);

        {
            // One critical section: removals, then additions. Readers see
            // either the old set or the new one, nothing in between.
            let mut index = self.index.write();
            index.remove_server(name);
            index.publish(name, &new_set);
        }

        info!(
            server = %name,
            total = new_set.total_count(),
            added = added.len(),
            removed = removed.len(),
            "[Capabilities] Reloaded"
        );

        let change = CapabilityChange {
            server: name.to_string(),
            tools: changed_kind(&added, &removed, "tool:"),
            prompts: changed_kind(&added, &removed, "prompt:"),
            resources: changed_kind(&added, &removed, "resource:")
                || changed_kind(&added, &removed, "template:"),
        };

        sets.insert(name.to_string(), new_set);
        drop(sets);

        if change.any() {
            let _ = self.changes.send(change);
        }

        Ok(())
    }

    /// Remove a disabled backend's capabilities entirely.
    pub async fn unpublish(&self, name: &str) {
        let guard = self.reload_guard(name);
        let _serialized = guard.lock().await;

        let mut sets = self.sets.lock().await;
        let Some(old_set) = sets.remove(name) else {
            debug!(server = %name, "[Capabilities] Nothing to unpublish");
            return;
        };

        self.index.write().remove_server(name);
        drop(sets);

        info!(server = %name, removed = old_set.total_count(), "[Capabilities] Unpublished");

        let change = CapabilityChange {
            server: name.to_string(),
            tools: !old_set.tools.is_empty(),
            prompts: !old_set.prompts.is_empty(),
            resources: !old_set.resources.is_empty() || !old_set.resource_templates.is_empty(),
        };
        if change.any() {
            let _ = self.changes.send(change);
        }
    }

    /// Names with a currently-published set
    pub async fn published_servers(&self) -> Vec<String> {
        self.sets.lock().await.keys().cloned().collect()
    }
}

fn changed_kind(added: &[String], removed: &[String], prefix: &str) -> bool {
    added.iter().any(|id| id.starts_with(prefix)) || removed.iter().any(|id| id.starts_with(prefix))
}
