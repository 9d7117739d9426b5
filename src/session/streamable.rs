//! Streamable HTTP style.
//!
//! Requests are POSTed and answered in the POST response; notifications and
//! responses get `202 Accepted`. A POSTed `initialize` without a session id
//! creates a session under a temporary id, and the id is promoted to its final
//! value once the service has answered the handshake. `GET` opens an event
//! stream for server-initiated messages, `DELETE` ends the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use rmcp::model::{ClientJsonRpcMessage, ErrorData, ServerJsonRpcMessage};
use serde_json::Value;
use uuid::Uuid;

use crate::session::link::{open_session, SessionLink};
use crate::session::{
    header_session_id, jsonrpc_error, lock, parse_message, request_id, session_not_found,
    with_session_header, SessionMultiplexer,
};

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<ServerJsonRpcMessage>>>>;
type Standalone = Arc<Mutex<Option<mpsc::UnboundedSender<ServerJsonRpcMessage>>>>;

/// Prefix of the id a session holds until its handshake completes.
pub const TEMP_ID_PREFIX: &str = "pending-";

#[derive(Clone)]
pub struct StreamableSession {
    link: SessionLink,
    /// POST requests waiting for their response, keyed by JSON-RPC id.
    waiters: Waiters,
    /// Open `GET` stream, if any.
    standalone: Standalone,
}

impl StreamableSession {
    pub fn close(&self) {
        self.link.close();
    }

    fn expect_response(&self, key: String) -> oneshot::Receiver<ServerJsonRpcMessage> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(key, tx);
        rx
    }

    fn forget(&self, key: &str) {
        lock(&self.waiters).remove(key);
    }

    fn is(&self, other: &StreamableSession) -> bool {
        Arc::ptr_eq(&self.waiters, &other.waiters)
    }
}

/// Waiter key for a server message that answers a client request.
fn response_key(message: &ServerJsonRpcMessage) -> Option<String> {
    let value = serde_json::to_value(message).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    value.get("id").map(Value::to_string)
}

fn start(mux: &Arc<SessionMultiplexer>, temp_id: &str) -> StreamableSession {
    let (link, outbound) = open_session(mux.server.clone(), temp_id);
    let session = StreamableSession {
        link,
        waiters: Arc::new(Mutex::new(HashMap::new())),
        standalone: Arc::new(Mutex::new(None)),
    };
    tokio::spawn(dispatch(mux.clone(), session.clone(), outbound));
    session
}

/// Route each server message to the POST awaiting it, else to the GET stream.
///
/// Runs until the session's service stops, then unregisters the session
/// under whichever id it holds.
async fn dispatch(
    mux: Arc<SessionMultiplexer>,
    session: StreamableSession,
    mut outbound: mpsc::Receiver<ServerJsonRpcMessage>,
) {
    while let Some(message) = outbound.next().await {
        let waiter = response_key(&message).and_then(|key| lock(&session.waiters).remove(&key));
        let message = match waiter {
            Some(waiter) => match waiter.send(message) {
                Ok(()) => continue,
                Err(message) => message,
            },
            None => message,
        };

        let standalone = lock(&session.standalone).clone();
        let undelivered = match standalone {
            Some(stream) => stream.unbounded_send(message).is_err(),
            None => true,
        };
        if undelivered {
            tracing::debug!(session = %session.link.id(), "no open stream for server message, dropping");
        }
    }

    lock(&session.waiters).clear();
    lock(&session.standalone).take();
    for closed in mux.streamable.remove_where(|_, s| s.handle.is(&session)) {
        tracing::debug!(state = ?closed.state, "streamable HTTP session ended");
    }
}

pub async fn post(
    State(mux): State<Arc<SessionMultiplexer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_post(mux, header_session_id(&headers), body).await
}

pub async fn post_with_id(
    State(mux): State<Arc<SessionMultiplexer>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Response {
    handle_post(mux, Some(session_id), body).await
}

async fn handle_post(mux: Arc<SessionMultiplexer>, session_id: Option<String>, body: Bytes) -> Response {
    let (value, message) = match parse_message(&body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let id = request_id(&value);

    match session_id {
        Some(session_id) => match mux.streamable.get(&session_id) {
            Some(session) => exchange(&mux, &session, &session_id, id, message).await,
            None => session_not_found(&session_id, id),
        },
        None if value.get("method").and_then(Value::as_str) == Some("initialize") => {
            initialize(&mux, id, message).await
        }
        None => jsonrpc_error(
            StatusCode::BAD_REQUEST,
            id,
            ErrorData::invalid_request("missing mcp-session-id header", None),
        ),
    }
}

/// Deliver a message to a live session and, for requests, await the answer.
async fn exchange(
    mux: &SessionMultiplexer,
    session: &StreamableSession,
    session_id: &str,
    id: Option<Value>,
    message: ClientJsonRpcMessage,
) -> Response {
    let Some(id) = id else {
        return match session.link.deliver(message).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(_) => {
                mux.streamable.remove(session_id);
                session_not_found(session_id, None)
            }
        };
    };

    let key = id.to_string();
    let waiter = session.expect_response(key.clone());
    if session.link.deliver(message).await.is_err() {
        session.forget(&key);
        mux.streamable.remove(session_id);
        return session_not_found(session_id, Some(id));
    }

    match waiter.await {
        Ok(reply) => with_session_header(Json(reply).into_response(), session_id),
        Err(_) => jsonrpc_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            Some(id),
            ErrorData::internal_error("session closed before responding", None),
        ),
    }
}

/// A session registered under its temporary id.
///
/// Dropping it without promoting unregisters and closes the session, which
/// also covers a client that disconnects mid-handshake.
struct PendingSession {
    mux: Arc<SessionMultiplexer>,
    temp_id: String,
    promoted: bool,
}

impl PendingSession {
    fn register(mux: &Arc<SessionMultiplexer>, temp_id: String, session: StreamableSession) -> Self {
        mux.streamable.insert_pending(&temp_id, session);
        Self {
            mux: mux.clone(),
            temp_id,
            promoted: false,
        }
    }

    /// Re-key under a fresh final id. `None` if the session already closed.
    fn promote(mut self) -> Option<String> {
        let final_id = Uuid::new_v4().to_string();
        self.promoted = self.mux.streamable.promote(&self.temp_id, &final_id);
        self.promoted.then_some(final_id)
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        if let Some(session) = self.mux.streamable.remove(&self.temp_id) {
            session.handle.close();
            tracing::debug!(session = %self.temp_id, "pending session discarded");
        }
    }
}

/// Create a session for an `initialize` request and promote it on success.
async fn initialize(
    mux: &Arc<SessionMultiplexer>,
    id: Option<Value>,
    message: ClientJsonRpcMessage,
) -> Response {
    let Some(id) = id else {
        return jsonrpc_error(
            StatusCode::BAD_REQUEST,
            None,
            ErrorData::invalid_request("initialize must be a request", None),
        );
    };

    let temp_id = format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4());
    let session = start(mux, &temp_id);
    let pending = PendingSession::register(mux, temp_id, session.clone());

    let waiter = session.expect_response(id.to_string());
    let reply = match session.link.deliver(message).await {
        Ok(()) => waiter.await.ok(),
        Err(_) => None,
    };
    match reply {
        Some(reply) => complete_initialize(pending, id, reply),
        None => jsonrpc_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            Some(id),
            ErrorData::internal_error("session ended during initialization", None),
        ),
    }
}

/// Promote on a successful handshake reply; any other reply discards the session.
fn complete_initialize(pending: PendingSession, id: Value, reply: ServerJsonRpcMessage) -> Response {
    let accepted = serde_json::to_value(&reply)
        .map(|value| value.get("result").is_some())
        .unwrap_or(false);
    if !accepted {
        tracing::debug!(session = %pending.temp_id, "initialize rejected");
        return Json(reply).into_response();
    }

    let temp_id = pending.temp_id.clone();
    match pending.promote() {
        Some(final_id) => {
            tracing::info!(session = %final_id, "streamable HTTP session initialized");
            with_session_header(Json(reply).into_response(), &final_id)
        }
        None => session_not_found(&temp_id, Some(id)),
    }
}

pub async fn get(State(mux): State<Arc<SessionMultiplexer>>, headers: HeaderMap) -> Response {
    open_stream(&mux, header_session_id(&headers))
}

pub async fn get_with_id(
    State(mux): State<Arc<SessionMultiplexer>>,
    Path(session_id): Path<String>,
) -> Response {
    open_stream(&mux, Some(session_id))
}

/// Open the standalone stream for server-initiated messages.
///
/// A newer stream replaces an older one.
fn open_stream(mux: &SessionMultiplexer, session_id: Option<String>) -> Response {
    let Some(session_id) = session_id else {
        return jsonrpc_error(
            StatusCode::BAD_REQUEST,
            None,
            ErrorData::invalid_request("missing mcp-session-id header", None),
        );
    };
    let Some(session) = mux.streamable.get(&session_id) else {
        return session_not_found(&session_id, None);
    };

    let (tx, rx) = mpsc::unbounded::<ServerJsonRpcMessage>();
    *lock(&session.standalone) = Some(tx);
    let events = rx.map(|message| Event::default().event("message").json_data(message));
    let response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    with_session_header(response, &session_id)
}

pub async fn delete(State(mux): State<Arc<SessionMultiplexer>>, headers: HeaderMap) -> Response {
    close(&mux, header_session_id(&headers))
}

pub async fn delete_with_id(
    State(mux): State<Arc<SessionMultiplexer>>,
    Path(session_id): Path<String>,
) -> Response {
    close(&mux, Some(session_id))
}

fn close(mux: &SessionMultiplexer, session_id: Option<String>) -> Response {
    let Some(session_id) = session_id else {
        return jsonrpc_error(
            StatusCode::BAD_REQUEST,
            None,
            ErrorData::invalid_request("missing mcp-session-id header", None),
        );
    };
    match mux.streamable.remove(&session_id) {
        Some(session) => {
            session.handle.close();
            tracing::info!(session = %session_id, "streamable HTTP session closed by client");
            StatusCode::OK.into_response()
        }
        None => session_not_found(&session_id, None),
    }
}
