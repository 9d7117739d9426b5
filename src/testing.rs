//! In-process MCP backends for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ErrorCode, GetPromptRequestParams,
    GetPromptResult, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, PaginatedRequestParams, Prompt, ReadResourceRequestParams,
    ReadResourceResult, Resource, ResourceTemplate, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServiceExt};
use serde_json::json;

use crate::backend::{BackendConnection, Connect};
use crate::config::{ServerConfig, TransportDescriptor, TransportKind};
use crate::error::SwitchboardError;

pub fn make_tool(name: &str, description: &str) -> Tool {
    let schema = Arc::new(
        json!({"type": "object", "properties": {"input": {"type": "string"}}})
            .as_object()
            .unwrap()
            .clone(),
    );
    Tool {
        name: name.to_string().into(),
        title: None,
        description: Some(description.to_string().into()),
        input_schema: schema,
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

/// Configurable backend that answers every call with `label:name`.
#[derive(Clone)]
pub struct TestBackend {
    label: String,
    tools: Vec<Tool>,
    prompts: Vec<Prompt>,
    resources: Vec<Resource>,
    templates: Vec<ResourceTemplate>,
    prompts_supported: bool,
    resources_supported: bool,
    templates_supported: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::named("test")
    }

    pub fn named(label: &str) -> Self {
        Self {
            label: label.to_string(),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            prompts_supported: true,
            resources_supported: true,
            templates_supported: true,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(make_tool(name, description));
        self
    }

    pub fn with_prompt(mut self, name: &str, description: &str) -> Self {
        let prompt = serde_json::from_value(json!({"name": name, "description": description}))
            .expect("valid prompt");
        self.prompts.push(prompt);
        self
    }

    pub fn with_resource(mut self, uri: &str, name: &str, description: &str) -> Self {
        let resource = serde_json::from_value(
            json!({"uri": uri, "name": name, "description": description}),
        )
        .expect("valid resource");
        self.resources.push(resource);
        self
    }

    pub fn with_template(mut self, uri_template: &str, name: &str, description: &str) -> Self {
        let template = serde_json::from_value(json!({
            "uriTemplate": uri_template,
            "name": name,
            "description": description,
        }))
        .expect("valid resource template");
        self.templates.push(template);
        self
    }

    pub fn without_prompts(mut self) -> Self {
        self.prompts_supported = false;
        self
    }

    pub fn without_resources(mut self) -> Self {
        self.resources_supported = false;
        self
    }

    pub fn without_templates(mut self) -> Self {
        self.templates_supported = false;
        self
    }

    /// Local names of the tools called so far, shared across clones.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn reply(&self, key: &str) -> String {
        format!("{}:{}", self.label, key)
    }
}

fn not_found(method: &'static str) -> McpError {
    McpError::new(ErrorCode::METHOD_NOT_FOUND, method, None)
}

impl ServerHandler for TestBackend {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder()
                .enable_tools()
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
            tools: self.tools.clone(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if !self.tools.iter().any(|t| t.name == request.name) {
            return Err(McpError::invalid_params(
                format!("no tool named {}", request.name),
                None,
            ));
        }
        self.calls.lock().unwrap().push(request.name.to_string());
        Ok(CallToolResult::success(vec![Content::text(
            self.reply(&request.name),
        )]))
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        if !self.prompts_supported {
            return Err(not_found("prompts/list"));
        }
        Ok(ListPromptsResult {
            prompts: self.prompts.clone(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        if !self.prompts.iter().any(|p| p.name == request.name) {
            return Err(McpError::invalid_params("no such prompt", None));
        }
        let result = serde_json::from_value(json!({
            "description": self.reply(&request.name),
            "messages": [
                {"role": "user", "content": {"type": "text", "text": self.reply(&request.name)}}
            ],
        }))
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(result)
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        if !self.resources_supported {
            return Err(not_found("resources/list"));
        }
        Ok(ListResourcesResult {
            resources: self.resources.clone(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let result = serde_json::from_value(json!({
            "contents": [{"uri": request.uri, "text": self.reply(&request.uri)}],
        }))
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(result)
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        if !self.templates_supported {
            return Err(not_found("resources/templates/list"));
        }
        Ok(ListResourceTemplatesResult {
            resource_templates: self.templates.clone(),
            next_cursor: None,
            meta: None,
        })
    }
}

/// A stdio descriptor that is never spawned.
pub fn descriptor(name: &str) -> TransportDescriptor {
    TransportDescriptor {
        name: name.to_string(),
        active: true,
        kind: TransportKind::Stdio {
            command: format!("mcp-{name}"),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        },
        handshake_timeout: Duration::from_secs(30),
    }
}

/// Config entry resolving to the same shape as [`descriptor`].
pub fn server_config(name: &str) -> ServerConfig {
    ServerConfig {
        command: Some(format!("mcp-{name}")),
        ..ServerConfig::default()
    }
}

/// Serve `backend` over an in-memory pipe and handshake a client to it.
pub async fn in_process_connection(name: &str, backend: TestBackend) -> BackendConnection {
    connect_in_process(descriptor(name), backend).await
}

pub async fn connect_in_process(
    descriptor: TransportDescriptor,
    backend: TestBackend,
) -> BackendConnection {
    let (client_io, server_io) = tokio::io::duplex(65536);
    tokio::spawn(async move {
        if let Ok(service) = backend.serve(server_io).await {
            let _ = service.waiting().await;
        }
    });
    let service = ().serve(client_io).await.expect("in-process handshake");
    BackendConnection::new(descriptor, service)
}

/// Connector that serves registered backends in process and refuses the rest.
#[derive(Default)]
pub struct FakeConnector {
    backends: HashMap<String, TestBackend>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, name: &str, backend: TestBackend) -> Self {
        self.backends.insert(name.to_string(), backend);
        self
    }

    pub fn attempts(&self, name: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connect for FakeConnector {
    async fn connect(&self, descriptor: &TransportDescriptor) -> crate::Result<BackendConnection> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(descriptor.name.clone())
            .or_default() += 1;
        match self.backends.get(&descriptor.name) {
            Some(backend) => Ok(connect_in_process(descriptor.clone(), backend.clone()).await),
            None => Err(SwitchboardError::Connection(
                descriptor.name.clone(),
                "connection refused".to_string(),
            )),
        }
    }
}

/// Text of the first content block of a tool result.
pub fn first_text(result: &CallToolResult) -> String {
    let value = serde_json::to_value(result).unwrap();
    value["content"][0]["text"].as_str().unwrap_or_default().to_string()
}
