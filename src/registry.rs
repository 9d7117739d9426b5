//! BackendRegistry owns the live backend connections and the current
//! routing snapshot, and reconciles both against a desired configuration.
//!
//! Reconciliations are serialized by the connection mutex, held for the whole
//! pass. Readers never take that lock: they clone the current
//! `Arc<RoutingTable>` out of the snapshot lock and release it immediately, so
//! an in-flight request keeps the table (and connections) it started with.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};

use crate::aggregate::{aggregate, RoutingTable};
use crate::backend::{
    connect_with_retry, BackendConnection, Connect, RetryPolicy, TransportConnector,
};
use crate::config::{
    validate_backend_name, ServerConfig, SwitchboardConfig, ToolOverride, TransportDescriptor,
};
use crate::router::ToolInfo;

/// Outcome of one reconciliation, by backend name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Newly connected (including reconnected after a descriptor change).
    pub added: Vec<String>,
    /// Torn down (including replaced after a descriptor change).
    pub removed: Vec<String>,
    /// Reused without reconnecting.
    pub kept: Vec<String>,
    /// Active in the configuration but not connected.
    pub failed: Vec<String>,
}

impl ReconcileReport {
    /// Whether the connection set changed.
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// The single entry point for backend lifecycle and routing state.
pub struct BackendRegistry {
    connector: Arc<dyn Connect>,
    retry: RetryPolicy,
    /// Live connections by backend name. Held across a whole reconcile.
    connections: Mutex<BTreeMap<String, Arc<BackendConnection>>>,
    routing: RwLock<Arc<RoutingTable>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// A registry with no backends that connects over real transports.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(TransportConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connect>) -> Self {
        Self {
            connector,
            retry: RetryPolicy::default(),
            connections: Mutex::new(BTreeMap::new()),
            routing: RwLock::new(Arc::new(RoutingTable::empty())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The current routing snapshot.
    pub async fn snapshot(&self) -> Arc<RoutingTable> {
        self.routing.read().await.clone()
    }

    /// Validate a parsed configuration and reconcile against it.
    pub async fn apply_config(&self, config: &SwitchboardConfig) -> crate::Result<ReconcileReport> {
        config.validate()?;
        Ok(self.reconcile(&config.servers, &config.tools).await)
    }

    /// Bring connections and routing in line with `servers` and `tools`.
    ///
    /// Unchanged backends are reused, removed ones are torn down after the new
    /// snapshot is in place, added ones are connected concurrently. A backend
    /// that fails to resolve or connect is reported and left out; it never
    /// fails the pass.
    pub async fn reconcile(
        &self,
        servers: &HashMap<String, ServerConfig>,
        tools: &HashMap<String, ToolOverride>,
    ) -> ReconcileReport {
        let mut connections = self.connections.lock().await;
        let mut report = ReconcileReport::default();

        let mut desired: BTreeMap<String, TransportDescriptor> = BTreeMap::new();
        for (name, server) in servers {
            if !server.is_active() {
                tracing::debug!(backend = %name, "skipping inactive backend");
                continue;
            }
            match validate_backend_name(name).and_then(|_| server.resolve(name)) {
                Ok(descriptor) => {
                    desired.insert(name.clone(), descriptor);
                }
                Err(e) => {
                    tracing::warn!(backend = %name, error = %e, "skipping backend");
                    report.failed.push(name.clone());
                }
            }
        }

        let mut retired = Vec::new();
        let current: Vec<String> = connections.keys().cloned().collect();
        for name in current {
            let unchanged = desired
                .get(&name)
                .zip(connections.get(&name))
                .is_some_and(|(wanted, live)| wanted == live.descriptor());
            if unchanged {
                report.kept.push(name);
            } else if let Some(connection) = connections.remove(&name) {
                if desired.contains_key(&name) {
                    tracing::info!(backend = %name, "backend configuration changed, reconnecting");
                }
                retired.push(connection);
                report.removed.push(name);
            }
        }

        let connector = self.connector.as_ref();
        let policy = self.retry;
        let attempts = desired
            .into_values()
            .filter(|descriptor| !connections.contains_key(&descriptor.name))
            .map(|descriptor| async move {
                let result = connect_with_retry(connector, &descriptor, policy).await;
                (descriptor.name, result)
            })
            .collect::<Vec<_>>();
        for (name, result) in join_all(attempts).await {
            match result {
                Ok(connection) => {
                    connections.insert(name.clone(), Arc::new(connection));
                    report.added.push(name);
                }
                Err(_) => report.failed.push(name),
            }
        }

        let live: Vec<Arc<BackendConnection>> = connections.values().cloned().collect();
        let table = aggregate(&live, tools).await;
        *self.routing.write().await = Arc::new(table);

        join_all(retired.iter().map(|connection| async move {
            if let Err(e) = connection.cleanup().await {
                tracing::warn!(backend = %connection.name(), error = %e, "backend cleanup failed");
            }
        }))
        .await;

        report.failed.sort();
        tracing::info!(
            added = ?report.added,
            removed = ?report.removed,
            kept = report.kept.len(),
            failed = ?report.failed,
            "reconciliation complete"
        );
        report
    }

    /// Every routable tool in the current snapshot.
    pub async fn tool_inventory(&self) -> Vec<ToolInfo> {
        self.snapshot().await.inventory()
    }

    /// Names of the connected backends, sorted.
    ///
    /// Read from the current snapshot, so it never waits on a reconcile.
    pub async fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .snapshot()
            .await
            .backends()
            .iter()
            .map(|backend| backend.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Tear down every backend and publish an empty snapshot.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down all backends");
        let mut connections = self.connections.lock().await;
        *self.routing.write().await = Arc::new(RoutingTable::empty());
        let retired: Vec<Arc<BackendConnection>> =
            std::mem::take(&mut *connections).into_values().collect();
        join_all(retired.iter().map(|connection| async move {
            if let Err(e) = connection.cleanup().await {
                tracing::warn!(backend = %connection.name(), error = %e, "backend cleanup failed");
            }
        }))
        .await;
    }
}
