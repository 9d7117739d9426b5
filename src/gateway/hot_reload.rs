//! Hot reload for `switchboard serve`.
//!
//! Watches the configuration file with `notify`. Each change (debounced by
//! 100ms) is re-parsed and handed to [`BackendRegistry::apply_config`], which
//! reconciles in place: untouched backends keep their connections. Connected
//! client peers then receive list-changed notifications.
//!
//! A file that fails to read, parse or validate leaves the current backends
//! and snapshot untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify::Watcher;
use tokio_util::sync::CancellationToken;

use crate::config::SwitchboardConfig;
use crate::error::SwitchboardError;
use crate::gateway::server::PeerList;
use crate::registry::{BackendRegistry, ReconcileReport};

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watch `config_path` and reconcile `registry` on each change until cancelled.
pub async fn run_hot_reload(
    config_path: PathBuf,
    registry: Arc<BackendRegistry>,
    peers: PeerList,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    // notify's EventHandler is implemented for FnMut; tokio's sender is not one
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create file watcher for hot-reload");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::error!(
            path = %config_path.display(),
            error = %e,
            "failed to watch config file for hot-reload"
        );
        return;
    }

    // Dropping the watcher silently stops events
    let _watcher = watcher;

    tracing::info!(path = %config_path.display(), "hot-reload watching config file");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(_)) => {
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}

                        match reload(&config_path, &registry).await {
                            Ok(report) => {
                                tracing::info!(
                                    path = %config_path.display(),
                                    added = report.added.len(),
                                    removed = report.removed.len(),
                                    failed = report.failed.len(),
                                    "config reloaded"
                                );
                                notify_peers(&peers).await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    path = %config_path.display(),
                                    "hot-reload failed, keeping previous config"
                                );
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "file watcher error during hot-reload");
                    }
                    None => {
                        tracing::debug!("hot-reload watcher channel closed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("hot-reload cancelled");
                return;
            }
        }
    }
}

/// Tell every connected peer that listings may have changed.
///
/// Peers whose transport has closed are pruned.
pub async fn notify_peers(peers: &PeerList) {
    let mut peers = peers.lock().await;
    let mut live_peers = Vec::with_capacity(peers.len());
    for peer in peers.drain(..) {
        match peer.notify_tool_list_changed().await {
            Ok(_) => {
                let _ = peer.notify_prompt_list_changed().await;
                let _ = peer.notify_resource_list_changed().await;
                live_peers.push(peer);
            }
            Err(e) => {
                tracing::debug!(error = %e, "pruning stale peer after list-changed error");
            }
        }
    }
    *peers = live_peers;
}

/// Read and parse a configuration file.
pub async fn load_config(config_path: &Path) -> crate::Result<SwitchboardConfig> {
    let content = tokio::fs::read_to_string(config_path).await.map_err(|e| {
        SwitchboardError::InvalidConfig(config_path.display().to_string(), e.to_string())
    })?;
    SwitchboardConfig::from_toml(&content)
}

async fn reload(config_path: &Path, registry: &BackendRegistry) -> crate::Result<ReconcileReport> {
    let config = load_config(config_path).await?;
    registry.apply_config(&config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, TestBackend};
    use rmcp::service::{Peer, RoleServer};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn registry() -> Arc<BackendRegistry> {
        let connector = FakeConnector::new()
            .with_backend("alpha", TestBackend::named("alpha").with_tool("echo", "Echo"))
            .with_backend("beta", TestBackend::named("beta").with_tool("echo", "Echo"));
        Arc::new(BackendRegistry::with_connector(Arc::new(connector)))
    }

    fn write_config(file: &NamedTempFile, body: &str) {
        std::fs::write(file.path(), body).expect("write config");
    }

    #[tokio::test]
    async fn test_reload_empty_config() {
        let mut temp = NamedTempFile::new().expect("create temp file");
        writeln!(temp, "# no backends yet").expect("write to temp file");

        let report = reload(temp.path(), &registry()).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_reload_invalid_toml_keeps_backends() {
        let registry = registry();
        let temp = NamedTempFile::new().expect("create temp file");
        write_config(&temp, "[servers.alpha]\ncommand = \"mcp-alpha\"\n");
        reload(temp.path(), &registry).await.unwrap();

        write_config(&temp, "this is not valid toml {{{{");
        assert!(reload(temp.path(), &registry).await.is_err());
        assert_eq!(registry.backend_names().await, vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_reload_missing_file() {
        let path = PathBuf::from("/nonexistent/path/switchboard.toml");
        let result = reload(&path, &registry()).await;
        assert!(matches!(result, Err(SwitchboardError::InvalidConfig(..))));
    }

    #[tokio::test]
    async fn test_reload_reconciles_in_place() {
        let registry = registry();
        let temp = NamedTempFile::new().expect("create temp file");
        write_config(&temp, "[servers.alpha]\ncommand = \"mcp-alpha\"\n");
        reload(temp.path(), &registry).await.unwrap();

        write_config(
            &temp,
            r#"
[servers.alpha]
command = "mcp-alpha"

[servers.beta]
command = "mcp-beta"
active = "false"

[tools."alpha--echo"]
name = "say"
"#,
        );
        let report = reload(temp.path(), &registry).await.unwrap();

        assert_eq!(report.kept, vec!["alpha"]);
        assert!(report.added.is_empty());
        let inventory = registry.tool_inventory().await;
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].exposed_name, "say");
    }

    #[tokio::test]
    async fn test_notify_peers_empty_vec() {
        let peers: PeerList = Arc::new(tokio::sync::Mutex::new(Vec::<Peer<RoleServer>>::new()));
        notify_peers(&peers).await;
        assert!(peers.lock().await.is_empty());
    }
}
