//! ToolGate gateway MCP handler
//!
//! Implements the MCP `ServerHandler` trait to expose aggregated tools,
//! prompts, and resources from the published capability index. Tool calls
//! run through the interceptor chain before they reach a backend; every
//! other request routes straight through the client pool.

use std::sync::Arc;

use parking_lot::RwLock;
use rmcp::{
    model::*,
    service::{NotificationContext, RequestContext},
    ErrorData as McpError, RoleServer, ServerHandler,
};
use tracing::{debug, info, warn};

use toolgate_mcp::ClientPool;

use crate::capabilities::PublishedIndex;
use crate::middleware::{error_result, InterceptorChain, ToolCallContext};
use crate::server::GatewayState;
use crate::sessions::SessionCache;

use super::context::session_key;
use super::notifier::ChangeNotifier;

/// Gateway protocol handler, cloned per connected session
#[derive(Clone)]
pub struct GatewayHandler {
    index: Arc<RwLock<PublishedIndex>>,
    pool: Arc<ClientPool>,
    state: Arc<GatewayState>,
    sessions: Arc<SessionCache>,
    notifier: Arc<ChangeNotifier>,
    chain: Arc<InterceptorChain>,
}

impl GatewayHandler {
    pub fn new(
        index: Arc<RwLock<PublishedIndex>>,
        pool: Arc<ClientPool>,
        state: Arc<GatewayState>,
        sessions: Arc<SessionCache>,
        notifier: Arc<ChangeNotifier>,
        chain: Arc<InterceptorChain>,
    ) -> Self {
        Self {
            index,
            pool,
            state,
            sessions,
            notifier,
            chain,
        }
    }

    /// Negotiate protocol version: answer with the client's version when
    /// we support it, otherwise with our maximum.
    fn negotiate_protocol_version(&self, client_version: &str) -> ProtocolVersion {
        let our_max = ProtocolVersion::LATEST;
        let our_max_str = our_max.to_string();

        if client_version > our_max_str.as_str() {
            debug!(
                client_version = %client_version,
                our_max = %our_max_str,
                "Client uses newer protocol, negotiating down"
            );
            our_max
        } else {
            serde_json::from_value(serde_json::Value::String(client_version.to_string()))
                .unwrap_or(our_max)
        }
    }
}

impl ServerHandler for GatewayHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools_with(ToolsCapability {
                    list_changed: Some(true),
                })
                .enable_prompts_with(PromptsCapability {
                    list_changed: Some(true),
                })
                .enable_resources_with(ResourcesCapability {
                    subscribe: Some(true),
                    list_changed: Some(true),
                })
                .build(),
            server_info: Implementation {
                name: "toolgate-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "ToolGate relays tools/prompts/resources from sandboxed backend \
                 MCP servers. Identifiers are served exactly as the backends \
                 expose them."
                    .to_string(),
            ),
        }
    }

    async fn initialize(
        &self,
        params: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        let negotiated = self.negotiate_protocol_version(&params.protocol_version.to_string());

        debug!(
            session = %session_key(&context.extensions),
            protocol_version = %negotiated,
            "Client initializing"
        );

        Ok(InitializeResult {
            protocol_version: negotiated,
            capabilities: self.get_info().capabilities,
            server_info: self.get_info().server_info,
            instructions: self.get_info().instructions,
        })
    }

    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        let session = session_key(&context.extensions);
        let peer = Arc::new(context.peer);
        self.notifier.register_peer(session.clone(), peer);
        info!(session = %session, "Client initialized, peer registered for notifications");
    }

    async fn list_tools(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self.index.read().tools();
        debug!(count = tools.len(), "list_tools");
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool_name = params.name.to_string();
        let server = self.index.read().server_for_tool(&tool_name);

        let Some(server) = server else {
            return Err(McpError::invalid_params(
                format!("Unknown tool: {}", tool_name),
                None,
            ));
        };

        let has_oauth = self.state.server_has_oauth(&server).await;
        let ctx = ToolCallContext::new(&tool_name)
            .with_server(&server, has_oauth)
            .with_arguments(params.arguments);

        let pool = Arc::clone(&self.pool);
        let result = self
            .chain
            .run(ctx, move |ctx| async move {
                let server = ctx.server_name.as_deref().unwrap_or_default().to_string();
                let session = match pool.handle(&server).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(server = %server, "Backend unreachable: {:#}", e);
                        return error_result(format!(
                            "Backend server '{}' is unreachable: {}",
                            server, e
                        ));
                    }
                };
                match session.call_tool(&ctx.tool_name, ctx.arguments.clone()).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(server = %server, tool = %ctx.tool_name, "Tool call failed: {:#}", e);
                        error_result(format!("Tool call failed: {}", e))
                    }
                }
            })
            .await;

        Ok(result)
    }

    async fn list_prompts(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let prompts = self.index.read().prompts();
        debug!(count = prompts.len(), "list_prompts");
        Ok(ListPromptsResult::with_all_items(prompts))
    }

    async fn get_prompt(
        &self,
        params: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let name = params.name.to_string();
        let server = self
            .index
            .read()
            .server_for_prompt(&name)
            .ok_or_else(|| McpError::invalid_params(format!("Unknown prompt: {}", name), None))?;

        let session = self
            .pool
            .handle(&server)
            .await
            .map_err(|e| McpError::internal_error(format!("Backend unreachable: {}", e), None))?;

        session
            .get_prompt(&name, params.arguments)
            .await
            .map_err(|e| McpError::internal_error(format!("Get prompt failed: {}", e), None))
    }

    async fn list_resources(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let resources = self.index.read().resources();
        debug!(count = resources.len(), "list_resources");
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn list_resource_templates(
        &self,
        _params: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let templates = self.index.read().resource_templates();
        debug!(count = templates.len(), "list_resource_templates");
        Ok(ListResourceTemplatesResult::with_all_items(templates))
    }

    async fn read_resource(
        &self,
        params: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = params.uri.to_string();
        let server = self
            .index
            .read()
            .server_for_resource(&uri)
            .ok_or_else(|| McpError::invalid_params(format!("Unknown resource: {}", uri), None))?;

        let session = self
            .pool
            .handle(&server)
            .await
            .map_err(|e| McpError::internal_error(format!("Backend unreachable: {}", e), None))?;

        session
            .read_resource(&uri)
            .await
            .map_err(|e| McpError::internal_error(format!("Read resource failed: {}", e), None))
    }

    async fn subscribe(
        &self,
        params: SubscribeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        let uri = params.uri.to_string();
        let server = self
            .index
            .read()
            .server_for_resource(&uri)
            .ok_or_else(|| McpError::invalid_params(format!("Unknown resource: {}", uri), None))?;

        let session = self
            .pool
            .handle(&server)
            .await
            .map_err(|e| McpError::internal_error(format!("Backend unreachable: {}", e), None))?;

        session
            .subscribe(&uri)
            .await
            .map_err(|e| McpError::internal_error(format!("Subscribe failed: {}", e), None))
    }

    async fn unsubscribe(
        &self,
        params: UnsubscribeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        let uri = params.uri.to_string();
        let server = self
            .index
            .read()
            .server_for_resource(&uri)
            .ok_or_else(|| McpError::invalid_params(format!("Unknown resource: {}", uri), None))?;

        let session = self
            .pool
            .handle(&server)
            .await
            .map_err(|e| McpError::internal_error(format!("Backend unreachable: {}", e), None))?;

        session
            .unsubscribe(&uri)
            .await
            .map_err(|e| McpError::internal_error(format!("Unsubscribe failed: {}", e), None))
    }

    async fn on_roots_list_changed(&self, context: NotificationContext<RoleServer>) {
        let session = session_key(&context.extensions);
        match context.peer.list_roots().await {
            Ok(result) => {
                debug!(
                    session = %session,
                    roots = result.roots.len(),
                    "Client roots changed, cache refreshed"
                );
                self.sessions.store_roots(session, result.roots);
            }
            Err(e) => {
                warn!(session = %session, "Failed to fetch roots after change: {}", e);
            }
        }
    }
}
