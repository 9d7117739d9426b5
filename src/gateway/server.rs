//! SwitchboardServer: rmcp ServerHandler backed by the BackendRegistry.
//!
//! Every inbound session runs its own clone of this handler. All clones share
//! the registry, so each request routes through whatever snapshot is current
//! when it arrives, and a reconciliation is visible to every session at once.
//!
//! Connected client peers are kept in a shared Vec so the hot-reload task can
//! broadcast list-changed notifications after each reconciliation.

use std::sync::Arc;

use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParams, ReadResourceRequestParams, ReadResourceResult, ServerCapabilities,
    ServerInfo,
};
use rmcp::service::{NotificationContext, Peer, RequestContext, RoleServer};
use rmcp::ErrorData as McpError;

use crate::registry::BackendRegistry;

/// Shared list of initialized client peers.
pub type PeerList = Arc<tokio::sync::Mutex<Vec<Peer<RoleServer>>>>;

/// The one logical MCP server clients see.
#[derive(Clone)]
pub struct SwitchboardServer {
    registry: Arc<BackendRegistry>,
    /// Stale peers are pruned on notification error.
    peers: PeerList,
}

impl SwitchboardServer {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            peers: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn registry(&self) -> Arc<BackendRegistry> {
        self.registry.clone()
    }

    /// Return the peers handle for the hot-reload task to broadcast notifications.
    pub fn peers_handle(&self) -> PeerList {
        self.peers.clone()
    }
}

fn into_mcp_error(method: &str, err: crate::SwitchboardError) -> McpError {
    tracing::debug!(method = %method, error = %err, "request failed");
    err.into()
}

impl ServerHandler for SwitchboardServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: "switchboard".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Switchboard aggregates several MCP servers. Tools are named backend--tool; \
                 prompt and resource descriptions carry a [backend] marker."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_prompts()
                .enable_resources()
                .build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.registry.snapshot().await.list_tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .call_tool(request)
            .await
            .map_err(|e| into_mcp_error("tools/call", e))
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            prompts: self.registry.snapshot().await.list_prompts(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .get_prompt(request)
            .await
            .map_err(|e| into_mcp_error("prompts/get", e))
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult {
            resources: self.registry.snapshot().await.list_resources(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .read_resource(request)
            .await
            .map_err(|e| into_mcp_error("resources/read", e))
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let snapshot = self.registry.snapshot().await;
        Ok(ListResourceTemplatesResult {
            resource_templates: snapshot.list_resource_templates().await,
            next_cursor: None,
            meta: None,
        })
    }

    /// Called by rmcp after the client sends `InitializedNotification`.
    ///
    /// Peers of sessions that have since ended are dropped here, so the list
    /// stays bounded without a reload.
    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        tracing::info!("MCP client initialized, storing peer for list-changed notifications");
        let mut peers = self.peers.lock().await;
        peers.retain(|peer| !peer.is_transport_closed());
        peers.push(context.peer.clone());
    }
}
