//! The link between an HTTP-facing session and its protocol service.
//!
//! Each inbound session runs one `SwitchboardServer` service over a pair of
//! channels: the HTTP layer pushes client messages into `inbound` and drains
//! server messages from the returned receiver.

use futures::channel::mpsc;
use futures::SinkExt;
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;

use crate::error::SwitchboardError;
use crate::gateway::server::SwitchboardServer;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct SessionLink {
    id: String,
    inbound: mpsc::Sender<ClientJsonRpcMessage>,
    cancel: CancellationToken,
}

impl SessionLink {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hand a client message to the session's service.
    pub async fn deliver(&self, message: ClientJsonRpcMessage) -> crate::Result<()> {
        let mut inbound = self.inbound.clone();
        inbound
            .send(message)
            .await
            .map_err(|_| SwitchboardError::SessionNotFound(self.id.clone()))
    }

    /// Stop the service. The outbound receiver ends once it has shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.inbound.is_closed()
    }
}

/// Start a protocol service for a new session.
pub fn open_session(
    server: SwitchboardServer,
    id: &str,
) -> (SessionLink, mpsc::Receiver<ServerJsonRpcMessage>) {
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientJsonRpcMessage>(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel::<ServerJsonRpcMessage>(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let session = id.to_string();
    let ct = cancel.clone();
    tokio::spawn(async move {
        // A close always wins over a handshake that is ready in the same poll
        let handshake = tokio::select! {
            biased;
            _ = ct.cancelled() => {
                tracing::debug!(session = %session, "session closed before handshake");
                return;
            }
            result = server.serve_with_ct((outbound_tx, inbound_rx), ct.clone()) => result,
        };
        match handshake {
            Ok(service) => {
                tracing::debug!(session = %session, "session service running");
                if let Err(e) = service.waiting().await {
                    tracing::debug!(session = %session, error = %e, "session service ended with error");
                }
            }
            Err(e) => {
                tracing::debug!(session = %session, error = %e, "session handshake failed");
            }
        }
        tracing::debug!(session = %session, "session service stopped");
    });

    let link = SessionLink {
        id: id.to_string(),
        inbound: inbound_tx,
        cancel,
    };
    (link, outbound_rx)
}
