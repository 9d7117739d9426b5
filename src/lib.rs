//! Switchboard: an aggregating MCP gateway.
//!
//! Connects to any number of MCP backends (subprocess, legacy SSE,
//! Streamable HTTP), merges their tools, resources and prompts into one
//! namespace under `<backend>--<tool>` qualified names, and serves that
//! namespace to many clients at once over SSE and Streamable HTTP sessions.
//! The backend set can be reconciled against a changed config while requests
//! are in flight.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod namespace;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(test)]
mod testing;

pub use aggregate::{aggregate, RoutingTable, ToolEntry};
pub use backend::{connect_with_retry, BackendConnection, Connect, RetryPolicy, TransportConnector};
pub use config::{
    parse_env_ref, resolve_env_vars, Credentials, ServerConfig, SwitchboardConfig, ToolOverride,
    TransportDescriptor, TransportKind,
};
pub use error::{Result, SwitchboardError};
pub use gateway::hot_reload::{load_config, notify_peers, run_hot_reload};
pub use gateway::server::{PeerList, SwitchboardServer};
pub use registry::{BackendRegistry, ReconcileReport};
pub use router::ToolInfo;
pub use session::{SessionMultiplexer, SessionState, SESSION_ID_HEADER};
