//! Legacy SSE style: `GET /sse` opens a stream whose first event names the
//! URL to POST client messages to; everything the server says arrives on the
//! stream as `message` events.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{future, stream, Stream, StreamExt};
use rmcp::model::ErrorData;
use serde::Deserialize;
use uuid::Uuid;

use crate::session::link::{open_session, SessionLink};
use crate::session::{
    header_session_id, jsonrpc_error, parse_message, request_id, session_not_found,
    SessionMultiplexer,
};

#[derive(Clone)]
pub struct SseSession {
    link: SessionLink,
}

impl SseSession {
    pub fn close(&self) {
        self.link.close();
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Unregisters the session when its event stream is dropped.
struct StreamGuard {
    mux: Arc<SessionMultiplexer>,
    id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(session) = self.mux.sse.remove(&self.id) {
            session.handle.close();
            tracing::info!(session = %self.id, "SSE client disconnected");
        }
    }
}

pub async fn open_stream(
    State(mux): State<Arc<SessionMultiplexer>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let claimed = query.session_id.or_else(|| header_session_id(&headers));
    if let Some(claim) = &claimed {
        for stale in mux.sse.remove_claimed(claim) {
            tracing::info!(
                session = %stale.handle.link.id(),
                claimed = %claim,
                "closing session superseded by a new stream"
            );
            stale.handle.close();
        }
    }

    let id = Uuid::new_v4().to_string();
    let (link, outbound) = open_session(mux.server.clone(), &id);
    mux.sse.insert_active(&id, SseSession { link }, claimed);
    tracing::info!(session = %id, "SSE client connected");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={id}"));
    let guard = StreamGuard {
        mux: mux.clone(),
        id,
    };
    let messages = outbound.map(move |message| {
        let _alive = &guard;
        Event::default().event("message").json_data(message)
    });

    Sse::new(stream::once(future::ready(Ok(endpoint))).chain(messages))
        .keep_alive(KeepAlive::default())
}

pub async fn post_message(
    State(mux): State<Arc<SessionMultiplexer>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    let Some(id) = query.session_id else {
        return jsonrpc_error(
            StatusCode::BAD_REQUEST,
            None,
            ErrorData::invalid_request("missing sessionId query parameter", None),
        );
    };
    let (value, message) = match parse_message(&body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };
    let Some(session) = mux.sse.get(&id) else {
        return session_not_found(&id, request_id(&value));
    };
    match session.link.deliver(message).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => {
            mux.sse.remove(&id);
            session_not_found(&id, request_id(&value))
        }
    }
}
