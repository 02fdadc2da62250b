//! In-memory store implementations for development and tests.
//!
//! Production deployments inject their own [`SessionStore`]; these exist so
//! a bridge can be stood up without external services — an explicit choice,
//! never a silent default.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use swb_domain::capability::{MemoryStore, Session, SessionEvent, SessionStore};
use swb_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_key(session_id: &str, app_name: &str, user_id: &str) -> String {
        format!("{app_name}/{user_id}/{session_id}")
    }

    /// Rewind a session's `last_update_time` for expiry tests.
    #[cfg(test)]
    pub(crate) fn backdate(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        by: chrono::Duration,
    ) {
        let key = Self::store_key(session_id, app_name, user_id);
        if let Some(session) = self.sessions.write().get_mut(&key) {
            session.last_update_time -= by;
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
    ) -> Result<Option<Session>> {
        let key = Self::store_key(session_id, app_name, user_id);
        Ok(self.sessions.read().get(&key).cloned())
    }

    async fn create(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        state: Map<String, Value>,
    ) -> Result<Session> {
        let session = Session {
            id: session_id.to_owned(),
            app_name: app_name.to_owned(),
            user_id: user_id.to_owned(),
            state,
            last_update_time: Utc::now(),
        };
        let key = Self::store_key(session_id, app_name, user_id);
        self.sessions.write().insert(key, session.clone());
        Ok(session)
    }

    async fn delete(&self, session_id: &str, app_name: &str, user_id: &str) -> Result<()> {
        let key = Self::store_key(session_id, app_name, user_id);
        self.sessions.write().remove(&key);
        Ok(())
    }

    async fn append_event(&self, session: &Session, event: SessionEvent) -> Result<()> {
        let key = Self::store_key(&session.id, &session.app_name, &session.user_id);
        let mut sessions = self.sessions.write();
        let stored = sessions
            .get_mut(&key)
            .ok_or_else(|| Error::Store(format!("session not found: {key}")))?;

        for (state_key, value) in event.state_delta {
            // Null signals removal.
            if value.is_null() {
                stored.state.remove(&state_key);
            } else {
                stored.state.insert(state_key, value);
            }
        }
        stored.last_update_time = Utc::now();
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Archive sink capturing sessions deleted by the session manager.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    archived: RwLock<Vec<Session>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.read().len()
    }

    pub fn archived_session_keys(&self) -> Vec<String> {
        self.archived.read().iter().map(|s| s.session_key()).collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn add_session(&self, session: &Session) -> Result<()> {
        self.archived.write().push(session.clone());
        Ok(())
    }
}
