//! Server configuration model
//!
//! A [`ServerConfiguration`] is an immutable snapshot of every enabled
//! backend server. It is replaced wholesale on each configuration-update
//! signal and never mutated in place; consumers that need the current view
//! hold an `Arc<ServerConfiguration>` and swap the whole pointer.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport used between agent clients and the gateway itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Single client over the process's stdin/stdout
    #[default]
    Stdio,
    /// Server-Sent-Events endpoint at `/sse`
    Sse,
    /// Streamable HTTP endpoint at `/mcp`
    StreamableHttp,
}

impl TransportMode {
    pub fn is_network(&self) -> bool {
        !matches!(self, Self::Stdio)
    }

    /// Route the protocol endpoint is served under for network transports
    pub fn route(&self) -> &'static str {
        match self {
            Self::Stdio => "-",
            Self::Sse => "/sse",
            Self::StreamableHttp => "/mcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdio" => Some(Self::Stdio),
            "sse" => Some(Self::Sse),
            "streaming" | "streamable-http" | "http" => Some(Self::StreamableHttp),
            _ => None,
        }
    }
}

/// How a backend server is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchSpec {
    /// Local sandboxed process speaking MCP over stdio
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote MCP server reached over streamable HTTP
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// OAuth sub-spec for a remote backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSpec {
    /// Provider name as known to the credential store
    pub provider: String,
    /// Scopes the backend requires
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// One enabled backend server, addressed by name (the configuration map key)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    #[serde(flatten)]
    pub launch: LaunchSpec,
    /// Container image backing the server, verified before first use
    /// unless the gateway runs in static mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSpec>,
}

impl ServerSpec {
    pub fn is_remote(&self) -> bool {
        matches!(self.launch, LaunchSpec::Remote { .. })
    }

    pub fn uses_oauth(&self) -> bool {
        self.oauth.is_some()
    }

    /// Remote servers with an OAuth sub-spec get a refresh worker
    pub fn is_remote_oauth(&self) -> bool {
        self.is_remote() && self.uses_oauth()
    }
}

/// Immutable snapshot of every enabled backend server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSpec>,
}

impl ServerConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Names of servers that are both remote and OAuth-capable
    pub fn remote_oauth_servers(&self) -> impl Iterator<Item = &str> {
        self.servers
            .iter()
            .filter(|(_, spec)| spec.is_remote_oauth())
            .map(|(name, _)| name.as_str())
    }

    /// Whether the named backend carries an OAuth sub-spec
    pub fn server_has_oauth(&self, name: &str) -> bool {
        self.get(name).map(ServerSpec::uses_oauth).unwrap_or(false)
    }
}

/// Process environment flags, read once at startup and never re-validated
/// mid-request.
#[derive(Debug, Clone)]
pub struct RuntimeFlags {
    /// The gateway itself runs inside a container (disables bearer auth
    /// and the OAuth refresh workers)
    pub container_mode: bool,
    /// Skip image resolution/verification entirely
    pub static_mode: bool,
    /// Dynamic Client Registration based OAuth handling is enabled
    pub oauth_dcr: bool,
    /// Interval between telemetry flushes
    pub metrics_interval: Duration,
    /// Log full telemetry snapshots instead of summaries
    pub verbose_telemetry: bool,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            container_mode: false,
            static_mode: false,
            oauth_dcr: true,
            metrics_interval: Duration::from_secs(300),
            verbose_telemetry: false,
        }
    }
}

impl RuntimeFlags {
    /// Read flags from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            container_mode: env_flag("TOOLGATE_IN_CONTAINER", defaults.container_mode),
            static_mode: env_flag("TOOLGATE_STATIC", defaults.static_mode),
            oauth_dcr: env_flag("TOOLGATE_OAUTH_DCR", defaults.oauth_dcr),
            metrics_interval: std::env::var("TOOLGATE_METRICS_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.metrics_interval),
            verbose_telemetry: env_flag("TOOLGATE_TELEMETRY_DEBUG", defaults.verbose_telemetry),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ServerConfiguration {
        serde_json::from_str(
            r#"{
                "servers": {
                    "filesystem": {
                        "type": "stdio",
                        "command": "npx",
                        "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
                        "image": "mcp/filesystem:latest"
                    },
                    "notion": {
                        "type": "remote",
                        "url": "https://mcp.notion.com/mcp",
                        "oauth": { "provider": "notion", "scopes": ["read"] }
                    },
                    "fetch": {
                        "type": "remote",
                        "url": "https://fetch.example.com/mcp"
                    }
                }
            }"#,
        )
        .expect("sample config parses")
    }

    #[test]
    fn test_parse_sample_config() {
        let config = sample_config();
        assert_eq!(config.len(), 3);

        let fs = config.get("filesystem").unwrap();
        assert!(!fs.is_remote());
        assert_eq!(fs.image.as_deref(), Some("mcp/filesystem:latest"));
        match &fs.launch {
            LaunchSpec::Stdio { command, args, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 3);
            }
            _ => panic!("expected stdio launch"),
        }
    }

    #[test]
    fn test_remote_oauth_servers() {
        let config = sample_config();
        let names: Vec<&str> = config.remote_oauth_servers().collect();
        assert_eq!(names, vec!["notion"]);

        assert!(config.server_has_oauth("notion"));
        assert!(!config.server_has_oauth("fetch"));
        assert!(!config.server_has_oauth("unknown"));
    }

    #[test]
    fn test_transport_mode_parse() {
        assert_eq!(TransportMode::parse("stdio"), Some(TransportMode::Stdio));
        assert_eq!(TransportMode::parse("sse"), Some(TransportMode::Sse));
        assert_eq!(
            TransportMode::parse("streaming"),
            Some(TransportMode::StreamableHttp)
        );
        assert_eq!(TransportMode::parse("carrier-pigeon"), None);

        assert!(!TransportMode::Stdio.is_network());
        assert!(TransportMode::Sse.is_network());
        assert_eq!(TransportMode::Sse.route(), "/sse");
        assert_eq!(TransportMode::StreamableHttp.route(), "/mcp");
    }

    #[test]
    fn test_configuration_is_a_snapshot() {
        // Replacing the snapshot must not affect holders of the old one.
        let first = sample_config();
        let held = first.clone();
        let mut next = first;
        next.servers.remove("notion");

        assert!(held.get("notion").is_some());
        assert!(next.get("notion").is_none());
    }
}
