//! Configuration sources
//!
//! A configuration source produces an initial [`ServerConfiguration`]
//! snapshot plus, when it supports live updates, a stream of replacement
//! snapshots and a stop handle for its watcher. Two variants exist and are
//! mutually exclusive per gateway process:
//!
//! - [`FileConfigSource`] - keyed by a set of on-disk JSON files, watched
//!   by content fingerprint
//! - [`WorkingSetSource`] - keyed by a stored working-set identifier,
//!   authoritative at read time (no update stream)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ring::digest::{Context, SHA256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ServerConfiguration;
use crate::error::ConfigError;

/// Result of reading a configuration source
#[derive(Debug)]
pub struct ConfigHandle {
    pub configuration: ServerConfiguration,
    /// Replacement snapshots; `None` when the source has no live updates
    pub updates: Option<mpsc::Receiver<ServerConfiguration>>,
    stop: CancellationToken,
}

impl ConfigHandle {
    /// Stop the source's watcher. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn read(&self) -> Result<ConfigHandle, ConfigError>;
}

/// How often the file watcher re-fingerprints its inputs
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// File-based configuration source.
///
/// Later files override earlier ones per server name, so a user file can
/// layer on top of a base file. The watcher polls by content fingerprint;
/// a parse failure after a change is logged and the previous snapshot
/// stays authoritative.
pub struct FileConfigSource {
    paths: Vec<PathBuf>,
    poll_interval: Duration,
}

impl FileConfigSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn load(paths: &[PathBuf]) -> Result<ServerConfiguration, ConfigError> {
        let mut merged = ServerConfiguration::new();
        for path in paths {
            let bytes = tokio::fs::read(path).await.map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let parsed: ServerConfiguration =
                serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            merged.servers.extend(parsed.servers);
        }
        Ok(merged)
    }

    /// Fingerprint all files as one digest; read failures hash as absent
    /// so a file appearing or disappearing also registers as a change.
    async fn fingerprint(paths: &[PathBuf]) -> String {
        let mut context = Context::new(&SHA256);
        for path in paths {
            context.update(path.to_string_lossy().as_bytes());
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    context.update(&(bytes.len() as u64).to_le_bytes());
                    context.update(&bytes);
                }
                Err(_) => context.update(b"absent"),
            }
        }
        hex::encode(context.finish().as_ref())
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn read(&self) -> Result<ConfigHandle, ConfigError> {
        if self.paths.is_empty() {
            return Err(ConfigError::NoFiles);
        }

        let configuration = Self::load(&self.paths).await?;
        info!(
            files = self.paths.len(),
            servers = configuration.len(),
            "[Config] Loaded configuration"
        );

        let (tx, rx) = mpsc::channel(4);
        let stop = CancellationToken::new();

        let paths = self.paths.clone();
        let poll_interval = self.poll_interval;
        let watcher_stop = stop.clone();
        tokio::spawn(async move {
            let mut last = Self::fingerprint(&paths).await;
            loop {
                tokio::select! {
                    _ = watcher_stop.cancelled() => {
                        debug!("[Config] File watcher stopped");
                        break;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                let current = Self::fingerprint(&paths).await;
                if current == last {
                    continue;
                }
                last = current;

                match Self::load(&paths).await {
                    Ok(configuration) => {
                        info!(
                            servers = configuration.len(),
                            "[Config] Configuration files changed, publishing update"
                        );
                        if tx.send(configuration).await.is_err() {
                            debug!("[Config] Update receiver dropped, watcher exiting");
                            break;
                        }
                    }
                    Err(e) => {
                        // Previous snapshot stays authoritative.
                        warn!("[Config] Ignoring unparseable update: {}", e);
                    }
                }
            }
        });

        Ok(ConfigHandle {
            configuration,
            updates: Some(rx),
            stop,
        })
    }
}

/// Persistent store of named working sets (SQLite-backed in production)
#[async_trait]
pub trait WorkingSetStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<ServerConfiguration>, ConfigError>;
}

/// Working-set-based configuration source.
///
/// The store is authoritative at read time; this variant reports no live
/// updates, so the gateway's watcher never runs for it.
pub struct WorkingSetSource {
    store: Arc<dyn WorkingSetStore>,
    id: String,
}

impl WorkingSetSource {
    pub fn new(store: Arc<dyn WorkingSetStore>, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for WorkingSetSource {
    async fn read(&self) -> Result<ConfigHandle, ConfigError> {
        let configuration = self
            .store
            .load(&self.id)
            .await?
            .ok_or_else(|| ConfigError::WorkingSetNotFound(self.id.clone()))?;

        info!(
            working_set = %self.id,
            servers = configuration.len(),
            "[Config] Loaded working set"
        );

        Ok(ConfigHandle {
            configuration,
            updates: None,
            stop: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    const BASE: &str = r#"{"servers": {
        "alpha": {"type": "stdio", "command": "alpha-server"},
        "beta": {"type": "remote", "url": "https://beta.example.com/mcp"}
    }}"#;

    const OVERLAY: &str = r#"{"servers": {
        "beta": {"type": "remote", "url": "https://beta.internal/mcp"}
    }}"#;

    #[tokio::test]
    async fn test_file_source_merges_later_files_over_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_config(&dir, "base.json", BASE);
        let overlay = write_config(&dir, "overlay.json", OVERLAY);

        let handle = FileConfigSource::new(vec![base, overlay]).read().await.unwrap();
        assert_eq!(handle.configuration.len(), 2);

        match &handle.configuration.get("beta").unwrap().launch {
            crate::domain::LaunchSpec::Remote { url, .. } => {
                assert_eq!(url, "https://beta.internal/mcp");
            }
            _ => panic!("expected remote launch"),
        }
        handle.stop();
    }

    #[tokio::test]
    async fn test_file_source_initial_parse_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write_config(&dir, "bad.json", "{not json");

        let err = FileConfigSource::new(vec![bad]).read().await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_file_source_no_files() {
        let err = FileConfigSource::new(vec![]).read().await.unwrap_err();
        assert!(matches!(err, ConfigError::NoFiles));
    }

    #[tokio::test]
    async fn test_file_source_publishes_update_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.json", BASE);

        let source =
            FileConfigSource::new(vec![path.clone()]).with_poll_interval(Duration::from_millis(20));
        let mut handle = source.read().await.unwrap();
        let mut updates = handle.updates.take().unwrap();

        // Rewrite the file with one server removed
        std::fs::write(&path, OVERLAY).unwrap();

        let updated = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("update before timeout")
            .expect("channel open");
        assert_eq!(updated.len(), 1);
        assert!(updated.get("alpha").is_none());

        handle.stop();
    }

    #[tokio::test]
    async fn test_file_source_keeps_previous_on_broken_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.json", BASE);

        let source =
            FileConfigSource::new(vec![path.clone()]).with_poll_interval(Duration::from_millis(20));
        let mut handle = source.read().await.unwrap();
        let mut updates = handle.updates.take().unwrap();

        // Broken content must not produce an update...
        std::fs::write(&path, "{broken").unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), updates.recv()).await;
        assert!(got.is_err(), "broken update must not be published");

        // ...but the watcher keeps running and picks up the next good one.
        std::fs::write(&path, OVERLAY).unwrap();
        let updated = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("update before timeout")
            .expect("channel open");
        assert_eq!(updated.len(), 1);

        handle.stop();
    }

    struct FixedStore(ServerConfiguration);

    #[async_trait]
    impl WorkingSetStore for FixedStore {
        async fn load(&self, id: &str) -> Result<Option<ServerConfiguration>, ConfigError> {
            Ok((id == "default").then(|| self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_working_set_source() {
        let config: ServerConfiguration = serde_json::from_str(BASE).unwrap();
        let store = Arc::new(FixedStore(config));

        let handle = WorkingSetSource::new(store.clone(), "default").read().await.unwrap();
        assert_eq!(handle.configuration.len(), 2);
        assert!(handle.updates.is_none(), "working sets have no live updates");

        let err = WorkingSetSource::new(store, "missing").read().await.unwrap_err();
        assert!(matches!(err, ConfigError::WorkingSetNotFound(_)));
    }
}
