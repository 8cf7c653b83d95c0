//! Backend MCP transports
//!
//! - Stdio: sandboxed local process via child process
//! - Remote: streamable HTTP
//!
//! A [`BackendSession`] wraps one live connection to one backend server
//! and exposes the discovery and invocation calls the gateway needs.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rmcp::{
    model::{
        CallToolRequestParams, CallToolResult, ClientCapabilities, ClientInfo,
        GetPromptRequestParams, GetPromptResult, Implementation, Prompt,
        ReadResourceRequestParams, ReadResourceResult, Resource, ResourceTemplate,
        SubscribeRequestParams, Tool, UnsubscribeRequestParams,
    },
    service::RunningService,
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig, ConfigureCommandExt,
        StreamableHttpClientTransport, TokioChildProcess,
    },
    ClientHandler, RoleClient, ServiceExt,
};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use toolgate_core::LaunchSpec;

/// Timeout for establishing a backend connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a backend currently exposes, captured in one discovery pass
#[derive(Debug, Clone, Default)]
pub struct BackendCapabilities {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
}

impl BackendCapabilities {
    pub fn total_count(&self) -> usize {
        self.tools.len()
            + self.prompts.len()
            + self.resources.len()
            + self.resource_templates.len()
    }
}

/// Type alias for a connected backend client
pub type BackendClient = RunningService<RoleClient, BackendClientHandler>;

/// Client handler identifying the gateway to backends
#[derive(Clone, Debug)]
pub struct BackendClientHandler {
    info: ClientInfo,
}

impl BackendClientHandler {
    pub fn new(server_name: &str) -> Self {
        Self {
            info: ClientInfo {
                protocol_version: Default::default(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: format!("toolgate-{}", server_name),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    title: Some("ToolGate Gateway".to_string()),
                    description: None,
                    icons: None,
                    website_url: None,
                },
                meta: None,
            },
        }
    }
}

impl ClientHandler for BackendClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }
}

/// One live connection to one backend server
#[derive(Debug)]
pub struct BackendSession {
    pub server_name: String,
    client: BackendClient,
}

impl BackendSession {
    /// Connect to a backend according to its launch spec.
    pub async fn connect(server_name: &str, launch: &LaunchSpec) -> Result<Self> {
        match launch {
            LaunchSpec::Stdio { command, args, env } => {
                Self::connect_stdio(server_name, command, args, env).await
            }
            LaunchSpec::Remote { url, headers } => {
                Self::connect_remote(server_name, url, headers).await
            }
        }
    }

    /// Connect to a stdio-based backend by spawning its process.
    async fn connect_stdio(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        // Commands copied from client configs often embed their arguments
        // ("npx -y @some/server"); split those before spawning.
        let (executable, parsed_args) = parse_command(command, args)?;

        info!(
            server = %server_name,
            executable = %executable,
            args = ?parsed_args,
            "[Backend] Connecting to stdio server"
        );

        let args_for_closure = parsed_args.clone();
        let env = env.clone();

        let transport = TokioChildProcess::new(Command::new(&executable).configure(move |cmd| {
            cmd.args(&args_for_closure)
                .envs(&env)
                .stderr(Stdio::null())
                .kill_on_drop(true);

            // Terminal signals sent to the gateway must not propagate to
            // backend processes.
            #[cfg(unix)]
            {
                cmd.process_group(0);
            }
        }))
        .context(format!(
            "Failed to spawn backend process. Command not found: {}. Ensure it's installed and in PATH.",
            executable
        ))?;

        let handler = BackendClientHandler::new(server_name);
        let connect = handler.serve(transport);
        let client = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .context("Backend connection timed out")?
            .context("Failed to initialize MCP client")?;

        debug!(server = %server_name, peer_info = ?client.peer_info(), "[Backend] Connected");

        Ok(Self {
            server_name: server_name.to_string(),
            client,
        })
    }

    /// Connect to a remote backend over streamable HTTP.
    async fn connect_remote(
        server_name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self> {
        info!(server = %server_name, url = %url, "[Backend] Connecting to remote server");

        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .with_context(|| format!("Invalid header name '{}'", key))?;
            let val = reqwest::header::HeaderValue::from_str(value)
                .with_context(|| format!("Invalid header value for '{}'", key))?;
            header_map.insert(name, val);
        }

        let http_client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .context("Failed to build HTTP client")?;

        let transport_config = StreamableHttpClientTransportConfig::with_uri(url);
        let transport = StreamableHttpClientTransport::with_client(http_client, transport_config);

        let handler = BackendClientHandler::new(server_name);
        let connect = handler.serve(transport);
        let client = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .context("Backend connection timed out")?
            .context("Failed to initialize MCP client")?;

        debug!(server = %server_name, peer_info = ?client.peer_info(), "[Backend] Connected");

        Ok(Self {
            server_name: server_name.to_string(),
            client,
        })
    }

    /// Discover everything the backend currently exposes.
    ///
    /// Only capability kinds the backend advertised during initialization
    /// are queried; listing a kind it never declared would be a protocol
    /// error on strict servers.
    pub async fn discover(&self) -> Result<BackendCapabilities> {
        let advertised = self
            .client
            .peer_info()
            .map(|info| info.capabilities.clone())
            .unwrap_or_default();

        let mut discovered = BackendCapabilities::default();

        if advertised.tools.is_some() {
            discovered.tools = self
                .client
                .peer()
                .list_tools(Default::default())
                .await
                .context("Failed to list tools")?
                .tools;
        }

        if advertised.prompts.is_some() {
            discovered.prompts = self
                .client
                .peer()
                .list_prompts(Default::default())
                .await
                .context("Failed to list prompts")?
                .prompts;
        }

        if advertised.resources.is_some() {
            discovered.resources = self
                .client
                .peer()
                .list_resources(Default::default())
                .await
                .context("Failed to list resources")?
                .resources;

            discovered.resource_templates = self
                .client
                .peer()
                .list_resource_templates(Default::default())
                .await
                .context("Failed to list resource templates")?
                .resource_templates;
        }

        info!(
            server = %self.server_name,
            tools = discovered.tools.len(),
            prompts = discovered.prompts.len(),
            resources = discovered.resources.len(),
            templates = discovered.resource_templates.len(),
            "[Backend] Discovered capabilities"
        );

        Ok(discovered)
    }

    /// Call a tool on this backend.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<CallToolResult> {
        debug!(server = %self.server_name, tool = %name, "[Backend] Calling tool");

        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParams {
                name: name.to_string().into(),
                arguments,
                task: None,
                meta: None,
            })
            .await
            .context("Tool call failed")?;

        Ok(result)
    }

    /// Fetch a prompt from this backend.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult> {
        let result = self
            .client
            .peer()
            .get_prompt(GetPromptRequestParams {
                name: name.to_string().into(),
                arguments,
                meta: None,
            })
            .await
            .context("Get prompt failed")?;

        Ok(result)
    }

    /// Read a resource from this backend.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let result = self
            .client
            .peer()
            .read_resource(ReadResourceRequestParams {
                uri: uri.to_string().into(),
                meta: None,
            })
            .await
            .context("Read resource failed")?;

        Ok(result)
    }

    /// Subscribe to update notifications for a resource.
    pub async fn subscribe(&self, uri: &str) -> Result<()> {
        self.client
            .peer()
            .subscribe(SubscribeRequestParams {
                uri: uri.to_string().into(),
                meta: None,
            })
            .await
            .context("Subscribe failed")?;
        Ok(())
    }

    /// Drop a resource update subscription.
    pub async fn unsubscribe(&self, uri: &str) -> Result<()> {
        self.client
            .peer()
            .unsubscribe(UnsubscribeRequestParams {
                uri: uri.to_string().into(),
                meta: None,
            })
            .await
            .context("Unsubscribe failed")?;
        Ok(())
    }

    /// Disconnect from the backend.
    pub async fn disconnect(self) -> Result<()> {
        info!(server = %self.server_name, "[Backend] Disconnecting");
        self.client.cancel().await.context("Failed to cancel service")?;
        Ok(())
    }
}

/// Parse a command string that may contain embedded arguments.
///
/// Handles common formats from client configs:
/// - "docker run -i --rm image" → ("docker", ["run", "-i", "--rm", "image"])
/// - "npx -y @some/server" → ("npx", ["-y", "@some/server"])
/// - "node" with args: ["server.js"] → ("node", ["server.js"])
fn parse_command(command: &str, args: &[String]) -> Result<(String, Vec<String>)> {
    // Separate args mean the command is just the executable
    if !args.is_empty() {
        return Ok((command.to_string(), args.to_vec()));
    }

    if command.contains(' ') {
        let parts = shell_words::split(command)
            .context("Failed to parse command string - check for unmatched quotes")?;

        if parts.is_empty() {
            return Err(anyhow::anyhow!("Empty command after parsing"));
        }

        Ok((parts[0].clone(), parts[1..].to_vec()))
    } else {
        Ok((command.to_string(), Vec::new()))
    }
}
