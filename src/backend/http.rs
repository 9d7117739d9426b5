//! Streamable HTTP backends.
//!
//! No subprocess, no output filtering: build rmcp's Streamable HTTP client for
//! the URL (with the bearer credential as its auth header) and handshake.

use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;

use crate::backend::Established;
use crate::config::{Credentials, TransportDescriptor};
use crate::error::SwitchboardError;

/// Build the client transport configuration for a backend URL.
///
/// An unparseable URL is a construction error and is never retried.
fn transport_config(
    name: &str,
    url: &str,
    credentials: Option<&Credentials>,
) -> crate::Result<StreamableHttpClientTransportConfig> {
    reqwest::Url::parse(url)
        .map_err(|e| SwitchboardError::Transport(name.to_string(), format!("invalid url '{url}': {e}")))?;

    let config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
    Ok(match credentials {
        Some(credentials) => config.auth_header(credentials.token().to_string()),
        None => config,
    })
}

/// Connect to a remote Streamable HTTP MCP server and perform the handshake.
pub async fn connect(
    descriptor: &TransportDescriptor,
    url: &str,
    credentials: Option<&Credentials>,
) -> crate::Result<Established> {
    let name = descriptor.name.as_str();
    let transport = StreamableHttpClientTransport::from_config(transport_config(
        name,
        url,
        credentials,
    )?);

    let cancel = CancellationToken::new();
    let handshake_result = tokio::time::timeout(
        descriptor.handshake_timeout,
        ().serve_with_ct(transport, cancel.child_token()),
    )
    .await;

    match handshake_result {
        Err(_elapsed) => {
            cancel.cancel();
            Err(SwitchboardError::Connection(
                name.to_string(),
                format!(
                    "HTTP MCP handshake timed out after {}s",
                    descriptor.handshake_timeout.as_secs()
                ),
            ))
        }
        Ok(Err(e)) => {
            cancel.cancel();
            Err(SwitchboardError::Connection(name.to_string(), e.to_string()))
        }
        Ok(Ok(service)) => Ok(Established {
            service,
            child: None,
            cancel,
        }),
    }
}
