//! Legacy SSE backends.
//!
//! The server keeps one `text/event-stream` open; its first `endpoint` event
//! names the URL that client-to-server messages are POSTed to. Server-to-client
//! messages arrive as `message` events. A pump task bridges that pair onto a
//! channel transport rmcp can drive.

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, Url};
use reqwest_eventsource::{Event, EventSource};
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;

use crate::backend::Established;
use crate::config::{Credentials, TransportDescriptor};
use crate::error::SwitchboardError;

/// Buffered messages per direction.
const CHANNEL_CAPACITY: usize = 32;

fn with_auth(
    request: reqwest::RequestBuilder,
    credentials: Option<&Credentials>,
) -> reqwest::RequestBuilder {
    match credentials {
        Some(credentials) => request.bearer_auth(credentials.token()),
        None => request,
    }
}

/// Resolve the announced endpoint against the stream URL.
fn resolve_endpoint(name: &str, base: &Url, announced: &str) -> crate::Result<Url> {
    base.join(announced.trim()).map_err(|e| {
        SwitchboardError::Connection(
            name.to_string(),
            format!("invalid endpoint '{announced}': {e}"),
        )
    })
}

/// Read events until the server announces its message endpoint.
async fn wait_for_endpoint(name: &str, events: &mut EventSource, base: &Url) -> crate::Result<Url> {
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Message(message)) if message.event == "endpoint" => {
                return resolve_endpoint(name, base, &message.data);
            }
            Ok(_) => continue,
            Err(e) => {
                events.close();
                return Err(SwitchboardError::Connection(name.to_string(), e.to_string()));
            }
        }
    }
    Err(SwitchboardError::Connection(
        name.to_string(),
        "event stream closed before the endpoint was announced".to_string(),
    ))
}

/// Bridge the event stream and message POSTs to rmcp's channel pair.
///
/// Ends when the stream fails or closes, when rmcp drops its sink, or on
/// cancellation. Dropping `inbound` makes the client service see EOF.
#[allow(clippy::too_many_arguments)]
async fn pump(
    name: String,
    mut events: EventSource,
    client: Client,
    endpoint: Url,
    credentials: Option<Credentials>,
    mut outbound: mpsc::Receiver<ClientJsonRpcMessage>,
    mut inbound: mpsc::Sender<ServerJsonRpcMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(Event::Message(message))) if message.event == "message" => {
                    match serde_json::from_str::<ServerJsonRpcMessage>(&message.data) {
                        Ok(parsed) => {
                            if inbound.send(parsed).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(backend = %name, error = %e, "discarding malformed SSE message");
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(backend = %name, error = %e, "backend event stream failed");
                    break;
                }
                None => break,
            },
            message = outbound.next() => match message {
                Some(message) => {
                    let request = with_auth(client.post(endpoint.clone()), credentials.as_ref())
                        .json(&message);
                    match request.send().await {
                        Ok(response) if !response.status().is_success() => {
                            tracing::warn!(
                                backend = %name,
                                status = %response.status(),
                                "backend rejected posted message"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(backend = %name, error = %e, "failed to post message to backend");
                        }
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    events.close();
    tracing::debug!(backend = %name, "SSE pump stopped");
}

/// Open the event stream, wait for the endpoint, then handshake over it.
pub async fn connect(
    descriptor: &TransportDescriptor,
    url: &str,
    credentials: Option<&Credentials>,
) -> crate::Result<Established> {
    let name = descriptor.name.as_str();
    let base = Url::parse(url).map_err(|e| {
        SwitchboardError::Transport(name.to_string(), format!("invalid url '{url}': {e}"))
    })?;

    let client = Client::new();
    let request = with_auth(
        client.get(base.clone()).header("Accept", "text/event-stream"),
        credentials,
    );
    let mut events = EventSource::new(request)
        .map_err(|e| SwitchboardError::Transport(name.to_string(), e.to_string()))?;

    let endpoint = match tokio::time::timeout(
        descriptor.handshake_timeout,
        wait_for_endpoint(name, &mut events, &base),
    )
    .await
    {
        Ok(result) => result?,
        Err(_elapsed) => {
            events.close();
            return Err(SwitchboardError::Connection(
                name.to_string(),
                format!(
                    "no endpoint announced within {}s",
                    descriptor.handshake_timeout.as_secs()
                ),
            ));
        }
    };
    tracing::debug!(backend = %name, endpoint = %endpoint, "SSE endpoint announced");

    let (outbound_tx, outbound_rx) = mpsc::channel::<ClientJsonRpcMessage>(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ServerJsonRpcMessage>(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    tokio::spawn(pump(
        name.to_string(),
        events,
        client,
        endpoint,
        credentials.cloned(),
        outbound_rx,
        inbound_tx,
        cancel.clone(),
    ));

    let handshake_result = tokio::time::timeout(
        descriptor.handshake_timeout,
        ().serve_with_ct((outbound_tx, inbound_rx), cancel.child_token()),
    )
    .await;

    match handshake_result {
        Ok(Ok(service)) => Ok(Established {
            service,
            child: None,
            cancel,
        }),
        Ok(Err(e)) => {
            cancel.cancel();
            Err(SwitchboardError::Connection(name.to_string(), e.to_string()))
        }
        Err(_elapsed) => {
            cancel.cancel();
            Err(SwitchboardError::Connection(
                name.to_string(),
                format!(
                    "SSE MCP handshake timed out after {}s",
                    descriptor.handshake_timeout.as_secs()
                ),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use std::time::Duration;

    #[test]
    fn test_relative_endpoint_resolves_against_stream_url() {
        let base = Url::parse("https://search.example.com/mcp/sse").unwrap();
        let endpoint = resolve_endpoint("search", &base, "/mcp/messages?sessionId=abc").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "https://search.example.com/mcp/messages?sessionId=abc"
        );
    }

    #[test]
    fn test_absolute_endpoint_is_kept() {
        let base = Url::parse("https://search.example.com/sse").unwrap();
        let endpoint =
            resolve_endpoint("search", &base, " https://other.example.com/post\n").unwrap();
        assert_eq!(endpoint.as_str(), "https://other.example.com/post");
    }

    #[tokio::test]
    async fn test_invalid_url_is_construction_error() {
        let descriptor = TransportDescriptor {
            name: "search".into(),
            active: true,
            kind: TransportKind::Sse {
                url: "::nope".into(),
                credentials: None,
            },
            handshake_timeout: Duration::from_secs(1),
        };
        let err = connect(&descriptor, "::nope", None).await.err().unwrap();
        assert!(matches!(err, SwitchboardError::Transport(ref name, _) if name == "search"));
        assert!(!err.is_retryable());
    }
}
