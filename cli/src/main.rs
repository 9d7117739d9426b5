//! Switchboard: aggregating MCP gateway.
//!
//! Two subcommands:
//! - `switchboard serve`: HTTP server exposing the merged namespace over
//!   legacy SSE (`/sse` + `/messages`) and Streamable HTTP (`/mcp`)
//! - `switchboard stdio`: bridge the merged namespace over stdin/stdout

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nimbus_switchboard::{
    load_config, run_hot_reload, BackendRegistry, SessionMultiplexer, SwitchboardServer,
};
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Switchboard: merge many MCP servers into one.
#[derive(Parser)]
#[command(
    name = "switchboard",
    version,
    about = "Switchboard: merge many MCP servers into one namespace"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the merged namespace over SSE and Streamable HTTP
    Serve {
        /// Path to switchboard.toml [default: ./switchboard.toml or ~/.config/switchboard/switchboard.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Bridge the merged namespace over STDIO
    Stdio {
        /// Path to switchboard.toml [default: ./switchboard.toml or ~/.config/switchboard/switchboard.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the stdio transport
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down switchboard");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config, port, host } => {
            let config = resolve_config(config)?;
            run_serve(config, host, port, cancel).await?;
        }
        Commands::Stdio { config } => {
            let config = resolve_config(config)?;
            run_stdio(config, cancel).await?;
        }
    }

    Ok(())
}

/// Load the config and connect every configured backend.
async fn build_registry(config_path: &Path) -> Result<Arc<BackendRegistry>> {
    let config = load_config(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
    let registry = Arc::new(BackendRegistry::new());
    let report = registry
        .apply_config(&config)
        .await
        .map_err(|e| anyhow::anyhow!("invalid config: {}", e))?;
    if !report.failed.is_empty() {
        tracing::warn!(failed = ?report.failed, "some backends could not be connected");
    }
    Ok(registry)
}

/// Serve both inbound streaming styles until cancelled, with hot reload.
async fn run_serve(
    config_path: PathBuf,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let registry = build_registry(&config_path).await?;
    let server = SwitchboardServer::new(registry.clone());

    tokio::spawn(run_hot_reload(
        config_path.clone(),
        registry.clone(),
        server.peers_handle(),
        cancel.child_token(),
    ));

    let sessions = SessionMultiplexer::new(server);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, "switchboard HTTP server listening");
    tracing::info!("SSE clients: http://{addr}/sse, Streamable HTTP clients: http://{addr}/mcp");

    sessions
        .serve(listener, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("switchboard HTTP server error: {}", e))?;

    registry.shutdown().await;
    tracing::info!("switchboard HTTP server stopped");
    Ok(())
}

/// Serve the merged namespace over stdin/stdout.
async fn run_stdio(config_path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let registry = build_registry(&config_path).await?;
    let server = SwitchboardServer::new(registry.clone());

    tokio::spawn(run_hot_reload(
        config_path,
        registry.clone(),
        server.peers_handle(),
        cancel.child_token(),
    ));

    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = server
        .serve_with_ct(transport, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize stdio transport: {:?}", e))?;

    tracing::info!("stdio transport initialized, waiting for messages");

    let outcome = tokio::select! {
        result = running.waiting() => match result {
            Ok(reason) => {
                tracing::info!(?reason, "stdio transport completed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "stdio transport error");
                Err(anyhow::anyhow!("stdio transport error: {}", e))
            }
        },
        _ = cancel.cancelled() => {
            tracing::info!("stdio transport cancelled");
            Ok(())
        }
    };

    cancel.cancel();
    registry.shutdown().await;
    outcome
}

/// Resolve config file path: explicit flag, then ./switchboard.toml, then
/// ~/.config/switchboard/switchboard.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("switchboard.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join("switchboard").join("switchboard.toml");
        if user.exists() {
            return Ok(user);
        }
    }

    Err(anyhow::anyhow!(
        "No switchboard.toml found. Searched ./switchboard.toml and \
         ~/.config/switchboard/switchboard.toml. Use --config to specify a path."
    ))
}
