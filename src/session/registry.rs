//! Inbound session bookkeeping.
//!
//! One registry per inbound transport style. The map sits behind a std mutex
//! that is never held across an await; handles are cloned out.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::session::lock;

/// Lifecycle of an inbound session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered under a temporary id while the handshake is in flight.
    Pending,
    Active,
    Closed,
}

/// A registered session.
#[derive(Debug, Clone)]
pub struct Session<S> {
    pub handle: S,
    pub state: SessionState,
    pub last_activity: Instant,
    /// Session id the client asked to resume, if any.
    pub claimed: Option<String>,
}

pub struct SessionRegistry<S> {
    sessions: Mutex<HashMap<String, Session<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Clone> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: &str, handle: S, state: SessionState, claimed: Option<String>) {
        let session = Session {
            handle,
            state,
            last_activity: Instant::now(),
            claimed,
        };
        lock(&self.sessions).insert(id.to_string(), session);
    }

    /// Register a session whose handshake has not completed.
    pub fn insert_pending(&self, id: &str, handle: S) {
        self.insert(id, handle, SessionState::Pending, None);
    }

    pub fn insert_active(&self, id: &str, handle: S, claimed: Option<String>) {
        self.insert(id, handle, SessionState::Active, claimed);
    }

    /// Look up a live session and record activity on it.
    pub fn get(&self, id: &str) -> Option<S> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(id)?;
        session.last_activity = Instant::now();
        Some(session.handle.clone())
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        lock(&self.sessions).get(id).map(|s| s.state)
    }

    pub fn last_activity(&self, id: &str) -> Option<Instant> {
        lock(&self.sessions).get(id).map(|s| s.last_activity)
    }

    /// Re-key a pending session under its final id and mark it active.
    ///
    /// Returns false when the temporary id is gone (closed mid-handshake).
    pub fn promote(&self, temp_id: &str, final_id: &str) -> bool {
        let mut sessions = lock(&self.sessions);
        match sessions.remove(temp_id) {
            Some(mut session) => {
                session.state = SessionState::Active;
                session.last_activity = Instant::now();
                sessions.insert(final_id.to_string(), session);
                true
            }
            None => false,
        }
    }

    /// Unregister a session, returning it in the `Closed` state.
    pub fn remove(&self, id: &str) -> Option<Session<S>> {
        let mut session = lock(&self.sessions).remove(id)?;
        session.state = SessionState::Closed;
        Some(session)
    }

    /// Unregister every session matching `predicate`.
    pub fn remove_where(&self, predicate: impl Fn(&str, &Session<S>) -> bool) -> Vec<Session<S>> {
        let mut sessions = lock(&self.sessions);
        let doomed: Vec<String> = sessions
            .iter()
            .filter(|(id, session)| predicate(id, session))
            .map(|(id, _)| id.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .map(|mut session| {
                session.state = SessionState::Closed;
                session
            })
            .collect()
    }

    /// Unregister any session registered under or claimed with `claim`.
    pub fn remove_claimed(&self, claim: &str) -> Vec<Session<S>> {
        self.remove_where(|id, session| id == claim || session.claimed.as_deref() == Some(claim))
    }

    pub fn drain(&self) -> Vec<Session<S>> {
        self.remove_where(|_, _| true)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}
