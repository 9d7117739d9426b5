//! Request routing over one routing snapshot.
//!
//! Listings of tools, resources and prompts are synthesized from the table.
//! Calls are resolved to exactly one owning backend and forwarded. Resource
//! templates are the exception: they are not cached and fan out live.

use futures::future::join_all;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult, Prompt,
    ReadResourceRequestParams, ReadResourceResult, Resource, ResourceTemplate, Tool,
};

use crate::aggregate::{RoutingTable, ToolEntry};
use crate::error::SwitchboardError;
use crate::namespace::{expose_tool, exposed_name, tag_with_backend};

/// One row of [`RoutingTable::inventory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub exposed_name: String,
    pub qualified_name: String,
    pub backend: String,
    pub description: Option<String>,
}

fn tagged(backend: &str, description: Option<&str>) -> String {
    match description {
        Some(text) => tag_with_backend(backend, text),
        None => format!("[{backend}]"),
    }
}

impl RoutingTable {
    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools
            .iter()
            .map(|entry| {
                expose_tool(
                    &entry.qualified_name,
                    entry.tool.clone(),
                    self.overrides.get(&entry.qualified_name),
                )
            })
            .collect()
    }

    /// Find the entry a client-visible tool name routes to.
    pub fn resolve_tool(&self, exposed: &str) -> crate::Result<&ToolEntry> {
        self.exposed
            .get(exposed)
            .map(|&index| &self.tools[index])
            .ok_or_else(|| SwitchboardError::UnknownTool(exposed.to_string()))
    }

    /// Forward a tool call under the backend's local tool name.
    pub async fn call_tool(&self, params: CallToolRequestParams) -> crate::Result<CallToolResult> {
        let entry = self.resolve_tool(&params.name)?;
        tracing::debug!(
            tool = %params.name,
            backend = %entry.backend.name(),
            local = %entry.tool.name,
            "routing tool call"
        );
        let forwarded = CallToolRequestParams {
            name: entry.tool.name.clone(),
            ..params
        };
        entry.backend.call_tool(forwarded).await
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.prompts
            .iter()
            .map(|entry| {
                let mut prompt = entry.prompt.clone();
                prompt.description = Some(tagged(
                    entry.backend.name(),
                    prompt.description.as_deref(),
                ));
                prompt
            })
            .collect()
    }

    pub async fn get_prompt(&self, params: GetPromptRequestParams) -> crate::Result<GetPromptResult> {
        let index = self
            .prompt_index
            .get(&params.name)
            .ok_or_else(|| SwitchboardError::UnknownPrompt(params.name.clone()))?;
        self.prompts[*index].backend.get_prompt(params).await
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources
            .iter()
            .map(|entry| {
                let mut resource = entry.resource.clone();
                resource.raw.description = Some(tagged(
                    entry.backend.name(),
                    resource.raw.description.as_deref(),
                ));
                resource
            })
            .collect()
    }

    pub async fn read_resource(
        &self,
        params: ReadResourceRequestParams,
    ) -> crate::Result<ReadResourceResult> {
        let index = self
            .resource_index
            .get(&params.uri)
            .ok_or_else(|| SwitchboardError::UnknownResource(params.uri.clone()))?;
        self.resources[*index].backend.read_resource(params).await
    }

    /// Ask every backend for its templates, in parallel, and concatenate.
    pub async fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        let answers = join_all(self.backends.iter().map(|backend| async move {
            (backend, backend.list_resource_templates().await)
        }))
        .await;

        let mut templates = Vec::new();
        for (backend, answer) in answers {
            match answer {
                Ok(found) => {
                    templates.extend(found.into_iter().map(|mut template| {
                        template.raw.name = tag_with_backend(backend.name(), &template.raw.name);
                        template.raw.description = Some(tagged(
                            backend.name(),
                            template.raw.description.as_deref(),
                        ));
                        template
                    }));
                }
                Err(SwitchboardError::MethodNotSupported(..)) => {}
                Err(e) => {
                    tracing::warn!(backend = %backend.name(), error = %e, "resource template listing failed");
                }
            }
        }
        templates
    }

    /// Every routable tool with its naming and ownership.
    pub fn inventory(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|entry| {
                let policy = self.overrides.get(&entry.qualified_name);
                ToolInfo {
                    exposed_name: exposed_name(&entry.qualified_name, policy).to_string(),
                    qualified_name: entry.qualified_name.clone(),
                    backend: entry.backend.name().to_string(),
                    description: policy
                        .and_then(|p| p.description.clone())
                        .or_else(|| entry.tool.description.as_ref().map(|d| d.to_string())),
                }
            })
            .collect()
    }
}
