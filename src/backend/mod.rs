//! Backend connections for Switchboard.
//!
//! One submodule per transport kind. Each builds a transport, performs the MCP
//! handshake (bounded by the descriptor's handshake timeout) and returns the
//! running client. [`connect_with_retry`] wraps any [`Connect`] implementation
//! with the fixed retry policy.

pub mod http;
pub mod sse;
pub mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ErrorCode, GetPromptRequestParams, GetPromptResult,
    Prompt, ReadResourceRequestParams, ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use rmcp::service::{Peer, RunningService, ServiceError};
use rmcp::RoleClient;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{TransportDescriptor, TransportKind};
use crate::error::SwitchboardError;

/// Number of connection attempts before a backend is given up on.
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Fixed delay between connection attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(2500);

/// Attempt bound and spacing for [`connect_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

/// What a successful transport-specific connect hands back.
pub struct Established {
    pub service: RunningService<RoleClient, ()>,
    /// Subprocess backing the connection, if any. Killed on cleanup.
    pub child: Option<Child>,
    /// Stops auxiliary tasks (stdout filters, SSE pumps) on cleanup.
    pub cancel: CancellationToken,
}

/// A live, handshaken connection to one backend.
///
/// Shared via `Arc` between the registry and routing snapshots; in-flight
/// calls on a superseded snapshot keep working until `cleanup()` runs.
pub struct BackendConnection {
    descriptor: TransportDescriptor,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
}

impl BackendConnection {
    /// Wrap an already-running client service.
    pub fn new(descriptor: TransportDescriptor, service: RunningService<RoleClient, ()>) -> Self {
        Self::from_established(
            descriptor,
            Established {
                service,
                child: None,
                cancel: CancellationToken::new(),
            },
        )
    }

    pub fn from_established(descriptor: TransportDescriptor, established: Established) -> Self {
        let peer = established.service.peer().clone();
        Self {
            descriptor,
            peer,
            service: Mutex::new(Some(established.service)),
            child: Mutex::new(established.child),
            cancel: established.cancel,
        }
    }

    /// Backend name (its configuration key).
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<Tool>> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| self.discovery_error("tools/list", e))
    }

    pub async fn list_resources(&self) -> crate::Result<Vec<Resource>> {
        self.peer
            .list_all_resources()
            .await
            .map_err(|e| self.discovery_error("resources/list", e))
    }

    pub async fn list_prompts(&self) -> crate::Result<Vec<Prompt>> {
        self.peer
            .list_all_prompts()
            .await
            .map_err(|e| self.discovery_error("prompts/list", e))
    }

    pub async fn list_resource_templates(&self) -> crate::Result<Vec<ResourceTemplate>> {
        self.peer
            .list_all_resource_templates()
            .await
            .map_err(|e| self.discovery_error("resources/templates/list", e))
    }

    /// Forward a tool call. `params.name` must already be the backend's local name.
    pub async fn call_tool(&self, params: CallToolRequestParams) -> crate::Result<CallToolResult> {
        self.peer
            .call_tool(params)
            .await
            .map_err(|e| self.call_error(e))
    }

    pub async fn get_prompt(&self, params: GetPromptRequestParams) -> crate::Result<GetPromptResult> {
        self.peer
            .get_prompt(params)
            .await
            .map_err(|e| self.call_error(e))
    }

    pub async fn read_resource(
        &self,
        params: ReadResourceRequestParams,
    ) -> crate::Result<ReadResourceResult> {
        self.peer
            .read_resource(params)
            .await
            .map_err(|e| self.call_error(e))
    }

    /// Close the client, stop auxiliary tasks and kill the subprocess if any.
    ///
    /// Idempotent: a second call finds nothing left to close.
    pub async fn cleanup(&self) -> crate::Result<()> {
        self.cancel.cancel();

        let service = self.service.lock().await.take();
        let mut outcome = Ok(());
        if let Some(service) = service {
            if let Err(e) = service.cancel().await {
                outcome = Err(SwitchboardError::Cleanup(self.name().to_string(), e.to_string()));
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(backend = %self.name(), error = %e, "backend process already gone");
            }
        }

        outcome
    }

    fn discovery_error(&self, method: &str, err: ServiceError) -> SwitchboardError {
        match err {
            ServiceError::McpError(data) if data.code == ErrorCode::METHOD_NOT_FOUND => {
                SwitchboardError::MethodNotSupported(self.name().to_string(), method.to_string())
            }
            other => SwitchboardError::Discovery(self.name().to_string(), format!("{method}: {other}")),
        }
    }

    fn call_error(&self, err: ServiceError) -> SwitchboardError {
        match err {
            ServiceError::McpError(data) => SwitchboardError::Backend(self.name().to_string(), data),
            other => SwitchboardError::Protocol(self.name().to_string(), other.to_string()),
        }
    }
}

/// Establishes one connection attempt to a backend.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, descriptor: &TransportDescriptor) -> crate::Result<BackendConnection>;
}

/// The production connector: builds the transport the descriptor names.
#[derive(Debug, Default, Clone)]
pub struct TransportConnector;

#[async_trait]
impl Connect for TransportConnector {
    async fn connect(&self, descriptor: &TransportDescriptor) -> crate::Result<BackendConnection> {
        let established = match &descriptor.kind {
            TransportKind::Stdio { .. } => stdio::connect(descriptor).await?,
            TransportKind::Sse { url, credentials } => {
                sse::connect(descriptor, url, credentials.as_ref()).await?
            }
            TransportKind::StreamableHttp { url, credentials } => {
                http::connect(descriptor, url, credentials.as_ref()).await?
            }
        };
        Ok(BackendConnection::from_established(
            descriptor.clone(),
            established,
        ))
    }
}

/// Connect with the fixed retry policy.
///
/// Only handshake failures are retried. Construction failures and unknown
/// transports return immediately. Exhausting the attempts fails this backend
/// alone; callers connect backends independently.
pub async fn connect_with_retry(
    connector: &dyn Connect,
    descriptor: &TransportDescriptor,
    policy: RetryPolicy,
) -> crate::Result<BackendConnection> {
    let name = descriptor.name.as_str();
    let mut attempt: u32 = 1;
    loop {
        tracing::info!(
            backend = %name,
            transport = descriptor.kind.label(),
            attempt,
            "connecting to backend"
        );
        match connector.connect(descriptor).await {
            Ok(connection) => {
                tracing::info!(backend = %name, attempt, "backend connected");
                return Ok(connection);
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(backend = %name, error = %e, "backend skipped, not retrying");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts => {
                tracing::error!(
                    backend = %name,
                    attempts = attempt,
                    error = %e,
                    "backend connection attempts exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    backend = %name,
                    attempt,
                    error = %e,
                    delay_ms = policy.delay.as_millis() as u64,
                    "backend connection failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
