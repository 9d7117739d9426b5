//! Subprocess backends speaking MCP over stdin/stdout.
//!
//! Uses raw `tokio::process::Command` instead of `TokioChildProcess` so that
//! stdout can be filtered: servers that print banners or logs to stdout would
//! otherwise corrupt the JSON-RPC stream. Non-JSON lines are discarded, stderr
//! is drained into debug logs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use rmcp::ServiceExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::backend::Established;
use crate::config::{TransportDescriptor, TransportKind};
use crate::error::SwitchboardError;

/// Spawn the child process for a subprocess backend.
///
/// Returns the `Child` with stdin, stdout, and stderr all piped. A spawn
/// failure is a construction error and is never retried.
fn spawn_stdio_child(
    name: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    cwd: Option<&PathBuf>,
) -> crate::Result<Child> {
    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.envs(env);

    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn()
        .map_err(|e| SwitchboardError::Transport(name.to_string(), e.to_string()))
}

/// Whether a stdout line should reach the protocol codec.
fn is_protocol_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line).is_ok()
}

/// Start a background task that filters stdout from the child process.
///
/// Valid JSON lines are forwarded to the returned reader, which rmcp uses as
/// its inbound half. Dropping the writer on EOF signals EOF to rmcp.
fn start_stdout_filter(
    child_stdout: tokio::process::ChildStdout,
    name: String,
    cancel: CancellationToken,
) -> tokio::io::ReadHalf<tokio::io::DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (reader, _client_writer) = tokio::io::split(client_side);
    let (_server_reader, mut writer) = tokio::io::split(server_side);

    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if is_protocol_line(&line) {
                                let with_newline = format!("{}\n", line);
                                if writer.write_all(with_newline.as_bytes()).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::debug!(
                                    backend = %name,
                                    line = %line,
                                    "discarding non-JSON stdout line"
                                );
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });

    reader
}

/// Drain stderr from the child process into debug logs.
fn start_stderr_drain(
    child_stderr: tokio::process::ChildStderr,
    name: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(backend = %name, line = %line, "backend stderr");
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

/// Spawn the child, wire its pipes and perform the MCP handshake.
///
/// On handshake failure the child is killed before returning, so a retry
/// starts from a fresh process.
pub async fn connect(descriptor: &TransportDescriptor) -> crate::Result<Established> {
    let name = descriptor.name.as_str();
    let TransportKind::Stdio {
        command,
        args,
        env,
        cwd,
    } = &descriptor.kind
    else {
        return Err(SwitchboardError::InvalidConfig(
            name.to_string(),
            "not a stdio descriptor".to_string(),
        ));
    };

    let mut child = spawn_stdio_child(name, command, args, env, cwd.as_ref())?;

    let child_stdin = child.stdin.take().ok_or_else(|| {
        SwitchboardError::Transport(name.to_string(), "failed to open stdin pipe".to_string())
    })?;
    let child_stdout = child.stdout.take().ok_or_else(|| {
        SwitchboardError::Transport(name.to_string(), "failed to open stdout pipe".to_string())
    })?;
    let child_stderr = child.stderr.take().ok_or_else(|| {
        SwitchboardError::Transport(name.to_string(), "failed to open stderr pipe".to_string())
    })?;

    let cancel = CancellationToken::new();
    let filtered_reader = start_stdout_filter(child_stdout, name.to_string(), cancel.clone());
    start_stderr_drain(child_stderr, name.to_string(), cancel.clone());

    let transport = (filtered_reader, child_stdin);

    let handshake_result = tokio::time::timeout(
        descriptor.handshake_timeout,
        ().serve_with_ct(transport, cancel.child_token()),
    )
    .await;

    let failure = match handshake_result {
        Ok(Ok(service)) => {
            return Ok(Established {
                service,
                child: Some(child),
                cancel,
            });
        }
        Err(_elapsed) => format!(
            "MCP handshake timed out after {}s",
            descriptor.handshake_timeout.as_secs()
        ),
        Ok(Err(e)) => e.to_string(),
    };

    cancel.cancel();
    if let Err(e) = child.kill().await {
        tracing::debug!(backend = %name, error = %e, "failed to kill backend after handshake failure");
    }
    Err(SwitchboardError::Connection(name.to_string(), failure))
}
