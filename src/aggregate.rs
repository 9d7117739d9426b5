//! Capability aggregation.
//!
//! Queries every live backend for its tools, resources and prompts and folds
//! the answers into one immutable [`RoutingTable`]. A table is a pure function
//! of the connection set, the backends' answers and the override set; it is
//! rebuilt in full on every reconciliation and never patched in place.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use rmcp::model::{Prompt, Resource, Tool};

use crate::backend::BackendConnection;
use crate::config::ToolOverride;
use crate::error::SwitchboardError;
use crate::namespace::{exposed_name, qualify};

/// A routable tool: its qualified name, owner and original descriptor.
#[derive(Clone)]
pub struct ToolEntry {
    pub qualified_name: String,
    pub backend: Arc<BackendConnection>,
    /// Descriptor as the backend returned it, local name included.
    pub tool: Tool,
}

#[derive(Clone)]
pub struct ResourceEntry {
    pub backend: Arc<BackendConnection>,
    pub resource: Resource,
}

#[derive(Clone)]
pub struct PromptEntry {
    pub backend: Arc<BackendConnection>,
    pub prompt: Prompt,
}

/// The routing snapshot.
#[derive(Default)]
pub struct RoutingTable {
    pub(crate) tools: Vec<ToolEntry>,
    /// Exposed name -> index into `tools`.
    pub(crate) exposed: HashMap<String, usize>,
    pub(crate) resources: Vec<ResourceEntry>,
    /// URI -> index into `resources`.
    pub(crate) resource_index: HashMap<String, usize>,
    pub(crate) prompts: Vec<PromptEntry>,
    /// Prompt name -> index into `prompts`.
    pub(crate) prompt_index: HashMap<String, usize>,
    pub(crate) overrides: HashMap<String, ToolOverride>,
    pub(crate) backends: Vec<Arc<BackendConnection>>,
}

/// What one backend answered during discovery.
pub struct Discovered {
    pub backend: Arc<BackendConnection>,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

/// Treat any discovery failure as "none of that kind".
fn or_none<T>(backend: &str, result: crate::Result<Vec<T>>) -> Vec<T> {
    match result {
        Ok(items) => items,
        Err(SwitchboardError::MethodNotSupported(_, method)) => {
            tracing::debug!(backend = %backend, method = %method, "backend does not support method");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(backend = %backend, error = %e, "capability discovery failed");
            Vec::new()
        }
    }
}

async fn discover(backend: Arc<BackendConnection>) -> Discovered {
    let (tools, resources, prompts) = tokio::join!(
        backend.list_tools(),
        backend.list_resources(),
        backend.list_prompts()
    );
    let name = backend.name().to_string();
    Discovered {
        tools: or_none(&name, tools),
        resources: or_none(&name, resources),
        prompts: or_none(&name, prompts),
        backend,
    }
}

/// Discover every connection in parallel and build the routing table.
///
/// `connections` must already be in backend-name order.
pub async fn aggregate(
    connections: &[Arc<BackendConnection>],
    overrides: &HashMap<String, ToolOverride>,
) -> RoutingTable {
    let discovered = join_all(connections.iter().cloned().map(discover)).await;
    let table = RoutingTable::build(discovered, overrides.clone());
    tracing::info!(
        backends = table.backends.len(),
        tools = table.tools.len(),
        resources = table.resources.len(),
        prompts = table.prompts.len(),
        "capabilities aggregated"
    );
    table
}

impl RoutingTable {
    /// A table with no backends.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fold discovery results, in the order given, into a table.
    pub fn build(discovered: Vec<Discovered>, overrides: HashMap<String, ToolOverride>) -> Self {
        let mut table = RoutingTable {
            overrides,
            ..Self::default()
        };

        for found in discovered {
            let backend = found.backend;
            let backend_name = backend.name().to_string();

            for tool in found.tools {
                let qualified_name = qualify(&backend_name, &tool.name);
                let policy = table.overrides.get(&qualified_name);
                if policy.is_some_and(|p| !p.enabled) {
                    tracing::debug!(tool = %qualified_name, "tool disabled by override");
                    continue;
                }
                let exposed = exposed_name(&qualified_name, policy).to_string();
                if table.exposed.contains_key(&exposed) {
                    tracing::warn!(
                        tool = %qualified_name,
                        exposed = %exposed,
                        "exposed tool name already taken, keeping the earlier tool"
                    );
                    continue;
                }
                table.exposed.insert(exposed, table.tools.len());
                table.tools.push(ToolEntry {
                    qualified_name,
                    backend: backend.clone(),
                    tool,
                });
            }

            for resource in found.resources {
                let uri = resource.raw.uri.clone();
                let entry = ResourceEntry {
                    backend: backend.clone(),
                    resource,
                };
                match table.resource_index.get(&uri) {
                    Some(&index) => {
                        tracing::debug!(
                            uri = %uri,
                            previous = %table.resources[index].backend.name(),
                            backend = %backend_name,
                            "resource URI collision, later backend wins"
                        );
                        table.resources[index] = entry;
                    }
                    None => {
                        table.resource_index.insert(uri, table.resources.len());
                        table.resources.push(entry);
                    }
                }
            }

            for prompt in found.prompts {
                let name = prompt.name.clone();
                let entry = PromptEntry {
                    backend: backend.clone(),
                    prompt,
                };
                match table.prompt_index.get(&name) {
                    Some(&index) => {
                        tracing::debug!(
                            prompt = %name,
                            previous = %table.prompts[index].backend.name(),
                            backend = %backend_name,
                            "prompt name collision, later backend wins"
                        );
                        table.prompts[index] = entry;
                    }
                    None => {
                        table.prompt_index.insert(name, table.prompts.len());
                        table.prompts.push(entry);
                    }
                }
            }

            table.backends.push(backend);
        }

        table
    }

    /// Backends this table was built from, in order.
    pub fn backends(&self) -> &[Arc<BackendConnection>] {
        &self.backends
    }

    pub fn tool_entries(&self) -> &[ToolEntry] {
        &self.tools
    }
}
