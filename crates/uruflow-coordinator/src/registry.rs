//! Registry of active worker sessions
//!
//! Index of `worker_id → session` enforcing at most one live session per
//! worker. Inserting for an already-registered worker evicts and closes the
//! prior session before the new one becomes visible. Eviction and explicit
//! removal drop the session's close hook first, so only a session's own
//! exit path runs deregistration side effects.

use dashmap::DashMap;
use std::sync::Arc;

use uruflow_core::types::WorkerId;

use crate::session::Session;

/// Single-connection-per-worker session index
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<WorkerId, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, displacing and closing any prior session for the
    /// same worker. The displaced session will not run its close hook.
    pub fn insert(&self, session: Arc<Session>) {
        let worker_id = session.worker_id().clone();
        match self.sessions.entry(worker_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let previous = entry.insert(session);
                tracing::warn!(
                    "worker {} reconnected, displacing previous session",
                    previous.worker_name()
                );
                previous.discard_close_hook();
                previous.close();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(session);
            }
        }
    }

    /// Remove and close a session without invoking its close hook
    pub fn remove(&self, worker_id: &WorkerId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(worker_id)?;
        session.discard_close_hook();
        session.close();
        Some(session)
    }

    /// Remove the entry only if it still refers to the given session.
    /// Used by a session's own exit path; a newer session that displaced
    /// this one stays registered. Does not close anything.
    pub fn remove_if_current(&self, worker_id: &WorkerId, session_id: &str) -> bool {
        self.sessions
            .remove_if(worker_id, |_, session| session.id() == session_id)
            .is_some()
    }

    /// Fetch the active session for a worker
    pub fn get(&self, worker_id: &WorkerId) -> Option<Arc<Session>> {
        self.sessions.get(worker_id).map(|entry| Arc::clone(&entry))
    }

    /// Whether a worker currently has a session
    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.sessions.contains_key(worker_id)
    }

    /// Copy of the current members, for fan-out traversals. Per-session
    /// sends happen outside any registry lock.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// IDs of all currently connected workers
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
