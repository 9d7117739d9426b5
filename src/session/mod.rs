//! Session multiplexer: serves the merged namespace to many clients at once
//! over the legacy SSE style and the Streamable HTTP style.
//!
//! Each style keeps its own [`SessionRegistry`]. Every session runs its own
//! `SwitchboardServer` service (see [`link`]); the HTTP handlers only move
//! JSON-RPC messages between requests and that service.

pub mod link;
pub mod registry;
pub mod sse;
pub mod streamable;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rmcp::model::{ClientJsonRpcMessage, ErrorData};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::SwitchboardError;
use crate::gateway::server::SwitchboardServer;
pub use registry::{Session, SessionRegistry, SessionState};
use sse::SseSession;
use streamable::StreamableSession;

/// Header carrying the session id in both directions.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

pub struct SessionMultiplexer {
    server: SwitchboardServer,
    sse: SessionRegistry<SseSession>,
    streamable: SessionRegistry<StreamableSession>,
}

impl SessionMultiplexer {
    pub fn new(server: SwitchboardServer) -> Arc<Self> {
        Arc::new(Self {
            server,
            sse: SessionRegistry::new(),
            streamable: SessionRegistry::new(),
        })
    }

    /// Routes for both styles:
    /// `GET /sse`, `POST /messages`, and `POST|GET|DELETE /mcp[/<session-id>]`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/sse", get(sse::open_stream))
            .route("/messages", post(sse::post_message))
            .route(
                "/mcp",
                post(streamable::post)
                    .get(streamable::get)
                    .delete(streamable::delete),
            )
            .route(
                "/mcp/:session_id",
                post(streamable::post_with_id)
                    .get(streamable::get_with_id)
                    .delete(streamable::delete_with_id),
            )
            .with_state(self.clone())
    }

    pub fn sse_sessions(&self) -> &SessionRegistry<SseSession> {
        &self.sse
    }

    pub fn streamable_sessions(&self) -> &SessionRegistry<StreamableSession> {
        &self.streamable
    }

    /// Serve [`Self::router`] on `listener` until `cancel` fires.
    ///
    /// Every session is closed as soon as shutdown begins; graceful shutdown
    /// waits for open responses, and event streams only end with their session.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let sessions = self.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                sessions.close_all();
            })
            .await
    }

    /// Close every session of both styles.
    pub fn close_all(&self) {
        let sse = self.sse.drain();
        let streamable = self.streamable.drain();
        tracing::info!(
            sse = sse.len(),
            streamable = streamable.len(),
            "closing all inbound sessions"
        );
        for session in sse {
            session.handle.close();
        }
        for session in streamable {
            session.handle.close();
        }
    }
}

/// Lock a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session id from the `mcp-session-id` header.
pub(crate) fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn with_session_header(mut response: Response, id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

pub(crate) fn jsonrpc_error(status: StatusCode, id: Option<Value>, error: ErrorData) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": error,
    });
    (status, Json(body)).into_response()
}

pub(crate) fn session_not_found(id: &str, request_id: Option<Value>) -> Response {
    tracing::debug!(session = %id, "unknown session");
    jsonrpc_error(
        StatusCode::NOT_FOUND,
        request_id,
        SwitchboardError::SessionNotFound(id.to_string()).into(),
    )
}

/// The id of a JSON-RPC request, or `None` for notifications and responses.
pub(crate) fn request_id(message: &Value) -> Option<Value> {
    message.get("method")?;
    message.get("id").cloned()
}

/// Decode a posted body, answering malformed input with a JSON-RPC error.
#[allow(clippy::result_large_err)]
pub(crate) fn parse_message(body: &[u8]) -> Result<(Value, ClientJsonRpcMessage), Response> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        jsonrpc_error(
            StatusCode::BAD_REQUEST,
            None,
            ErrorData::parse_error(e.to_string(), None),
        )
    })?;
    let message = serde_json::from_value(value.clone()).map_err(|e| {
        jsonrpc_error(
            StatusCode::BAD_REQUEST,
            value.get("id").cloned(),
            ErrorData::invalid_request(e.to_string(), None),
        )
    })?;
    Ok((value, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendRegistry;
    use std::time::Duration;

    #[test]
    fn test_request_id_only_for_requests() {
        assert_eq!(
            request_id(&json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})),
            Some(json!(7))
        );
        assert_eq!(
            request_id(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"})),
            None
        );
        assert_eq!(request_id(&json!({"jsonrpc": "2.0", "id": 7, "result": {}})), None);
    }

    #[test]
    fn test_parse_message_rejects_garbage() {
        let response = parse_message(b"not json").err().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = parse_message(br#"{"hello": "world"}"#).err().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_message_accepts_notification() {
        let (value, _) =
            parse_message(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert_eq!(value["method"], "notifications/initialized");
    }

    #[tokio::test]
    async fn test_shutdown_completes_with_open_event_stream() {
        let mux = SessionMultiplexer::new(SwitchboardServer::new(Arc::new(BackendRegistry::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let mux = mux.clone();
            let cancel = cancel.clone();
            async move { mux.serve(listener, cancel).await }
        });

        let mut stream = reqwest::get(format!("http://{addr}/sse")).await.unwrap();
        let first = stream.chunk().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("event: endpoint"));
        assert_eq!(mux.sse_sessions().len(), 1);

        cancel.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(3), server).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))), "server did not stop: {finished:?}");
        assert!(mux.sse_sessions().is_empty());
        drop(stream);
    }

    #[test]
    fn test_lock_recovers_from_poisoning() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }

    #[test]
    fn test_header_session_id() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_session_id(&headers), None);
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(header_session_id(&headers).as_deref(), Some("abc"));
    }
}
