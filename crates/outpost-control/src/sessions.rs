//! Session registry: client id to live control session
//!
//! Populated after a successful handshake so dialed-back proxy transports
//! can find their owner. A session removes itself during teardown.

use crate::session::ControlSession;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<ControlSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, session: Arc<ControlSession>) {
        debug!(client_id = %session.client_id(), "session registered");
        self.sessions
            .insert(session.client_id().to_string(), session);
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ControlSession>> {
        self.sessions.get(client_id).map(|s| s.value().clone())
    }

    pub fn remove(&self, client_id: &str) {
        if self.sessions.remove(client_id).is_some() {
            debug!(client_id, "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ask every live session to close. Teardown is asynchronous; callers
    /// poll `len()` to observe the drain.
    pub fn shutdown_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().shutdown();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
