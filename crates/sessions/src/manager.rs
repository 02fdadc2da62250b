//! The session manager: a registry over an injected session store.
//!
//! Adds key/user tracking, per-user quotas with oldest-first eviction,
//! TTL-based expiry (sessions with pending client-side tool calls are
//! preserved — a suspended human-in-the-loop exchange must survive), a
//! processed-message ledger, and state CRUD applied by appending synthetic
//! state events through the store.
//!
//! Store failures never propagate out of the state operations: they are
//! logged and surfaced as `false` / `None`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use swb_domain::capability::{MemoryStore, Session, SessionEvent, SessionStore};
use swb_domain::config::SessionConfig;
use swb_domain::trace::TraceEvent;
use swb_domain::Result;

use crate::store::InMemorySessionStore;

/// Resolved identity of a tracked session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub app_name: String,
    pub user_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Tracking {
    /// `"{app_name}:{session_id}"` keys.
    session_keys: HashSet<String>,
    /// user_id → set of session keys.
    user_sessions: HashMap<String, HashSet<String>>,
    /// session key → message ids already processed.  Ids are never removed
    /// while the session lives.
    processed_message_ids: HashMap<String, HashSet<String>>,
    /// session_id → identity, invalidated when the session is untracked.
    metadata_cache: HashMap<String, SessionMeta>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    memory: Option<Arc<dyn MemoryStore>>,
    config: SessionConfig,
    tracking: Mutex<Tracking>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        memory: Option<Arc<dyn MemoryStore>>,
        config: SessionConfig,
    ) -> Self {
        tracing::info!(
            timeout_secs = config.timeout_secs,
            cleanup_interval_secs = config.cleanup_interval_secs,
            max_sessions_per_user = ?config.max_sessions_per_user,
            memory = memory.is_some(),
            "session manager initialized"
        );
        Self {
            store,
            memory,
            config,
            tracking: Mutex::new(Tracking::default()),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Development/test convenience over [`InMemorySessionStore`].
    /// Production deployments construct [`SessionManager::new`] with their
    /// own store.
    pub fn in_memory(config: SessionConfig) -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()), None, config)
    }

    /// Canonical registry index for a session.
    pub fn session_key(app_name: &str, session_id: &str) -> String {
        format!("{app_name}:{session_id}")
    }

    fn split_key(key: &str) -> Option<(&str, &str)> {
        key.split_once(':')
    }

    /// The underlying store, for handing through to the runner.
    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    // ── Session lifecycle ──────────────────────────────────────────

    /// Get an existing session or create it with `initial_state`.
    ///
    /// When the user is at quota and this reference would track a new key,
    /// the user's session with the smallest `last_update_time` is evicted
    /// first.
    pub async fn get_or_create(
        &self,
        app_name: &str,
        session_id: &str,
        user_id: &str,
        initial_state: Map<String, Value>,
    ) -> Result<Session> {
        let key = Self::session_key(app_name, session_id);

        let is_new_key = !self.tracking.lock().session_keys.contains(&key);
        if is_new_key {
            if let Some(max) = self.config.max_sessions_per_user {
                let at_quota = self
                    .tracking
                    .lock()
                    .user_sessions
                    .get(user_id)
                    .map_or(0, HashSet::len)
                    >= max;
                if at_quota {
                    self.evict_oldest_user_session(user_id).await;
                }
            }
        }

        let session = match self.store.get(session_id, app_name, user_id).await? {
            Some(session) => {
                tracing::debug!(session_key = %key, "retrieved existing session");
                session
            }
            None => {
                let session = self
                    .store
                    .create(session_id, app_name, user_id, initial_state)
                    .await?;
                TraceEvent::SessionCreated {
                    session_key: key.clone(),
                    user_id: user_id.to_owned(),
                }
                .emit();
                session
            }
        };

        self.track(&key, user_id, session_id, app_name);
        Ok(session)
    }

    fn track(&self, key: &str, user_id: &str, session_id: &str, app_name: &str) {
        let mut tracking = self.tracking.lock();
        tracking.session_keys.insert(key.to_owned());
        tracking
            .user_sessions
            .entry(user_id.to_owned())
            .or_default()
            .insert(key.to_owned());
        tracking.metadata_cache.insert(
            session_id.to_owned(),
            SessionMeta {
                app_name: app_name.to_owned(),
                user_id: user_id.to_owned(),
            },
        );
    }

    fn untrack(&self, key: &str, user_id: &str) {
        let mut tracking = self.tracking.lock();
        tracking.session_keys.remove(key);
        tracking.processed_message_ids.remove(key);
        if let Some((_, session_id)) = Self::split_key(key) {
            tracking.metadata_cache.remove(session_id);
        }
        if let Some(keys) = tracking.user_sessions.get_mut(user_id) {
            keys.remove(key);
            if keys.is_empty() {
                tracking.user_sessions.remove(user_id);
            }
        }
    }

    /// Archive (when a memory store is configured) and delete a session,
    /// then drop it from the registry.
    pub async fn delete_session(&self, session: &Session) {
        let key = session.session_key();

        if let Some(memory) = &self.memory {
            if let Err(e) = memory.add_session(session).await {
                tracing::error!(session_key = %key, error = %e, "failed to archive session to memory");
            }
        }

        if let Err(e) = self
            .store
            .delete(&session.id, &session.app_name, &session.user_id)
            .await
        {
            tracing::error!(session_key = %key, error = %e, "failed to delete session");
        }

        self.untrack(&key, &session.user_id);
    }

    async fn evict_oldest_user_session(&self, user_id: &str) {
        let keys: Vec<String> = self
            .tracking
            .lock()
            .user_sessions
            .get(user_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        let mut oldest: Option<Session> = None;
        for key in keys {
            let Some((app_name, session_id)) = Self::split_key(&key) else {
                continue;
            };
            match self.store.get(session_id, app_name, user_id).await {
                Ok(Some(session)) => {
                    let is_older = oldest
                        .as_ref()
                        .map_or(true, |o| session.last_update_time < o.last_update_time);
                    if is_older {
                        oldest = Some(session);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(session_key = %key, error = %e, "error checking session age");
                }
            }
        }

        if let Some(session) = oldest {
            TraceEvent::SessionEvicted {
                session_key: session.session_key(),
                user_id: user_id.to_owned(),
                reason: "per-user quota".into(),
            }
            .emit();
            self.delete_session(&session).await;
        }
    }

    // ── State management ───────────────────────────────────────────

    /// Apply `delta` to the session state by appending a synthetic state
    /// event through the store.
    ///
    /// With `merge = false` the caller is responsible for nulling the keys
    /// it wants removed; the delta is applied identically either way.
    ///
    /// Returns false when the session is missing, the delta is empty, or
    /// the store fails.
    pub async fn update_state(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        delta: Map<String, Value>,
        merge: bool,
    ) -> bool {
        let session = match self.store.get(session_id, app_name, user_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!(
                    app_name,
                    session_id,
                    "session not found for state update (may still be creating)"
                );
                return false;
            }
            Err(e) => {
                tracing::error!(app_name, session_id, error = %e, "failed to load session for state update");
                return false;
            }
        };

        if delta.is_empty() {
            tracing::debug!(app_name, session_id, "empty state delta, nothing to apply");
            return false;
        }

        match self
            .store
            .append_event(&session, SessionEvent::state_update(delta))
            .await
        {
            Ok(()) => {
                tracing::debug!(app_name, session_id, merge, "session state updated");
                true
            }
            Err(e) => {
                tracing::error!(app_name, session_id, error = %e, "failed to update session state");
                false
            }
        }
    }

    /// Current state map, or None when the session is missing or the store
    /// fails.
    pub async fn get_state(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
    ) -> Option<Map<String, Value>> {
        match self.store.get(session_id, app_name, user_id).await {
            Ok(Some(session)) => Some(session.state),
            Ok(None) => {
                tracing::debug!(app_name, session_id, "session not found when reading state");
                None
            }
            Err(e) => {
                tracing::error!(app_name, session_id, error = %e, "failed to read session state");
                None
            }
        }
    }

    pub async fn get_state_value(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        key: &str,
        default: Value,
    ) -> Value {
        match self.get_state(session_id, app_name, user_id).await {
            Some(state) => state.get(key).cloned().unwrap_or(default),
            None => default,
        }
    }

    pub async fn set_state_value(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        key: &str,
        value: Value,
    ) -> bool {
        let mut delta = Map::new();
        delta.insert(key.to_owned(), value);
        self.update_state(session_id, app_name, user_id, delta, true)
            .await
    }

    /// Remove the given keys from the session state (null-value removal).
    pub async fn remove_state_keys(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        keys: &[&str],
    ) -> bool {
        let Some(state) = self.get_state(session_id, app_name, user_id).await else {
            return false;
        };

        let delta: Map<String, Value> = keys
            .iter()
            .filter(|k| state.contains_key(**k))
            .map(|k| ((*k).to_owned(), Value::Null))
            .collect();

        if delta.is_empty() {
            tracing::debug!(app_name, session_id, "no matching keys to remove");
            return true;
        }

        self.update_state(session_id, app_name, user_id, delta, true)
            .await
    }

    /// Clear the session state, optionally preserving keys with the given
    /// prefixes (e.g. `["user:", "app:"]`).
    pub async fn clear_state(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        preserve_prefixes: &[&str],
    ) -> bool {
        let Some(state) = self.get_state(session_id, app_name, user_id).await else {
            return false;
        };

        let keys_to_remove: Vec<&str> = state
            .keys()
            .filter(|key| !preserve_prefixes.iter().any(|p| key.starts_with(p)))
            .map(String::as_str)
            .collect();

        if keys_to_remove.is_empty() {
            return true;
        }

        self.remove_state_keys(session_id, app_name, user_id, &keys_to_remove)
            .await
    }

    /// Seed state values.  Without `overwrite`, keys that already exist are
    /// left untouched.
    pub async fn initialize_state(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        initial: Map<String, Value>,
        overwrite: bool,
    ) -> bool {
        let delta = if overwrite {
            initial
        } else {
            let current = self
                .get_state(session_id, app_name, user_id)
                .await
                .unwrap_or_default();
            let filtered: Map<String, Value> = initial
                .into_iter()
                .filter(|(k, _)| !current.contains_key(k))
                .collect();
            if filtered.is_empty() {
                tracing::debug!(app_name, session_id, "no new state values to initialize");
                return true;
            }
            filtered
        };

        self.update_state(session_id, app_name, user_id, delta, true)
            .await
    }

    /// Apply a delta to every tracked session of a user.  Returns a
    /// per-session-key success map.
    pub async fn bulk_update_user_state(
        &self,
        user_id: &str,
        delta: Map<String, Value>,
        app_name_filter: Option<&str>,
    ) -> HashMap<String, bool> {
        let keys: Vec<String> = self
            .tracking
            .lock()
            .user_sessions
            .get(user_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();

        let mut results = HashMap::new();
        for key in keys {
            let Some((app_name, session_id)) = Self::split_key(&key) else {
                continue;
            };
            if let Some(filter) = app_name_filter {
                if app_name != filter {
                    continue;
                }
            }
            let ok = self
                .update_state(session_id, app_name, user_id, delta.clone(), true)
                .await;
            results.insert(key, ok);
        }
        results
    }

    // ── Message ledger ─────────────────────────────────────────────

    pub fn mark_messages_processed<I>(&self, app_name: &str, session_id: &str, message_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        let key = Self::session_key(app_name, session_id);
        let mut tracking = self.tracking.lock();
        let processed = tracking.processed_message_ids.entry(key).or_default();
        for id in message_ids {
            if !id.is_empty() {
                processed.insert(id);
            }
        }
    }

    pub fn get_processed_message_ids(&self, app_name: &str, session_id: &str) -> HashSet<String> {
        let key = Self::session_key(app_name, session_id);
        self.tracking
            .lock()
            .processed_message_ids
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    // ── Lookup & counters ──────────────────────────────────────────

    /// Resolve a session id to its `(app_name, user_id)` identity.  Cached;
    /// falls back to a linear scan of tracked keys for sessions tracked
    /// before the cache existed.  Cache entries are invalidated when the
    /// session is untracked.
    pub fn session_metadata(&self, session_id: &str) -> Option<SessionMeta> {
        let mut tracking = self.tracking.lock();
        if let Some(meta) = tracking.metadata_cache.get(session_id) {
            return Some(meta.clone());
        }

        let suffix = format!(":{session_id}");
        let found = tracking.user_sessions.iter().find_map(|(user_id, keys)| {
            keys.iter()
                .find(|key| key.ends_with(&suffix))
                .map(|key| (user_id.clone(), key.clone()))
        });

        let (user_id, key) = found?;
        let (app_name, _) = Self::split_key(&key)?;
        let meta = SessionMeta {
            app_name: app_name.to_owned(),
            user_id,
        };
        tracking
            .metadata_cache
            .insert(session_id.to_owned(), meta.clone());
        Some(meta)
    }

    pub fn session_count(&self) -> usize {
        self.tracking.lock().session_keys.len()
    }

    pub fn user_session_count(&self, user_id: &str) -> usize {
        self.tracking
            .lock()
            .user_sessions
            .get(user_id)
            .map_or(0, HashSet::len)
    }

    // ── Expiry ─────────────────────────────────────────────────────

    /// One cleanup pass: expire sessions idle past the timeout, preserving
    /// any with pending client-side tool calls.
    pub async fn run_cleanup_once(&self) {
        let now = Utc::now();
        let timeout = ChronoDuration::seconds(self.config.timeout_secs as i64);
        let keys: Vec<String> = self.tracking.lock().session_keys.iter().cloned().collect();
        let mut expired = 0usize;

        for key in keys {
            let Some((app_name, session_id)) = Self::split_key(&key) else {
                continue;
            };
            let Some(user_id) = self.owner_of(&key) else {
                continue;
            };

            match self.store.get(session_id, app_name, &user_id).await {
                Ok(Some(session)) => {
                    let age = now.signed_duration_since(session.last_update_time);
                    if age <= timeout {
                        continue;
                    }
                    let pending = session.pending_tool_calls();
                    if pending.is_empty() {
                        TraceEvent::SessionExpired {
                            session_key: key.clone(),
                            age_secs: age.num_seconds(),
                        }
                        .emit();
                        self.delete_session(&session).await;
                        expired += 1;
                    } else {
                        TraceEvent::SessionPreserved {
                            session_key: key.clone(),
                            pending_tool_calls: pending.len(),
                        }
                        .emit();
                    }
                }
                Ok(None) => {
                    // Gone from the store; drop the registry entry.
                    self.untrack(&key, &user_id);
                }
                Err(e) => {
                    tracing::error!(session_key = %key, error = %e, "error checking session expiry");
                }
            }
        }

        if expired > 0 {
            tracing::info!(expired, "cleaned up expired sessions");
        }
    }

    fn owner_of(&self, key: &str) -> Option<String> {
        self.tracking
            .lock()
            .user_sessions
            .iter()
            .find(|(_, keys)| keys.contains(key))
            .map(|(user_id, _)| user_id.clone())
    }

    /// Start the periodic cleanup task.  Idempotent; the task holds only a
    /// weak reference and exits when the manager is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock();
        if task.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.cleanup_interval();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.run_cleanup_once().await;
            }
        }));
        tracing::debug!("session cleanup task started");
    }

    pub fn stop_cleanup(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
            tracing::debug!("session cleanup task stopped");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryMemoryStore, InMemorySessionStore};
    use serde_json::json;
    use swb_domain::capability::PENDING_TOOL_CALLS_KEY;

    fn config(timeout_secs: u64, max_per_user: Option<usize>) -> SessionConfig {
        SessionConfig {
            timeout_secs,
            cleanup_interval_secs: 1,
            max_sessions_per_user: max_per_user,
            auto_cleanup: false,
        }
    }

    fn manager_with_store(
        cfg: SessionConfig,
    ) -> (SessionManager, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        (SessionManager::new(store.clone(), None, cfg), store)
    }

    #[tokio::test]
    async fn get_or_create_tracks_sessions() {
        let (manager, _) = manager_with_store(config(1200, None));
        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();
        manager
            .get_or_create("app", "t2", "u1", Map::new())
            .await
            .unwrap();

        assert_eq!(manager.session_count(), 2);
        assert_eq!(manager.user_session_count("u1"), 2);
        assert_eq!(manager.user_session_count("u2"), 0);
    }

    #[tokio::test]
    async fn quota_evicts_oldest_session() {
        let (manager, store) = manager_with_store(config(1200, Some(2)));
        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();
        manager
            .get_or_create("app", "t2", "u1", Map::new())
            .await
            .unwrap();
        // t1 is the oldest.
        store.backdate("t1", "app", "u1", chrono::Duration::hours(1));

        manager
            .get_or_create("app", "t3", "u1", Map::new())
            .await
            .unwrap();

        assert_eq!(manager.user_session_count("u1"), 2);
        assert!(store.get("t1", "app", "u1").await.unwrap().is_none());
        assert!(store.get("t2", "app", "u1").await.unwrap().is_some());
        assert!(store.get("t3", "app", "u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_and_read_state() {
        let (manager, _) = manager_with_store(config(1200, None));
        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();

        let mut delta = Map::new();
        delta.insert("color".into(), json!("blue"));
        assert!(manager.update_state("t1", "app", "u1", delta, true).await);

        let state = manager.get_state("t1", "app", "u1").await.unwrap();
        assert_eq!(state.get("color"), Some(&json!("blue")));
        assert_eq!(
            manager
                .get_state_value("t1", "app", "u1", "color", Value::Null)
                .await,
            json!("blue")
        );
        assert_eq!(
            manager
                .get_state_value("t1", "app", "u1", "missing", json!("fallback"))
                .await,
            json!("fallback")
        );
    }

    #[tokio::test]
    async fn update_state_missing_session_or_empty_delta_is_false() {
        let (manager, _) = manager_with_store(config(1200, None));
        assert!(
            !manager
                .update_state("ghost", "app", "u1", Map::new(), true)
                .await
        );

        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();
        assert!(
            !manager
                .update_state("t1", "app", "u1", Map::new(), true)
                .await
        );
    }

    #[tokio::test]
    async fn remove_state_keys_via_null() {
        let (manager, _) = manager_with_store(config(1200, None));
        let mut initial = Map::new();
        initial.insert("a".into(), json!(1));
        initial.insert("b".into(), json!(2));
        manager
            .get_or_create("app", "t1", "u1", initial)
            .await
            .unwrap();

        assert!(
            manager
                .remove_state_keys("t1", "app", "u1", &["a", "nope"])
                .await
        );
        let state = manager.get_state("t1", "app", "u1").await.unwrap();
        assert!(!state.contains_key("a"));
        assert!(state.contains_key("b"));
    }

    #[tokio::test]
    async fn clear_state_preserves_prefixes() {
        let (manager, _) = manager_with_store(config(1200, None));
        let mut initial = Map::new();
        initial.insert("user:name".into(), json!("alice"));
        initial.insert("scratch".into(), json!(1));
        manager
            .get_or_create("app", "t1", "u1", initial)
            .await
            .unwrap();

        assert!(manager.clear_state("t1", "app", "u1", &["user:"]).await);
        let state = manager.get_state("t1", "app", "u1").await.unwrap();
        assert!(state.contains_key("user:name"));
        assert!(!state.contains_key("scratch"));
    }

    #[tokio::test]
    async fn initialize_state_respects_existing_values() {
        let (manager, _) = manager_with_store(config(1200, None));
        let mut initial = Map::new();
        initial.insert("a".into(), json!("original"));
        manager
            .get_or_create("app", "t1", "u1", initial)
            .await
            .unwrap();

        let mut seed = Map::new();
        seed.insert("a".into(), json!("overwritten"));
        seed.insert("b".into(), json!("new"));
        assert!(
            manager
                .initialize_state("t1", "app", "u1", seed.clone(), false)
                .await
        );
        let state = manager.get_state("t1", "app", "u1").await.unwrap();
        assert_eq!(state.get("a"), Some(&json!("original")));
        assert_eq!(state.get("b"), Some(&json!("new")));

        assert!(manager.initialize_state("t1", "app", "u1", seed, true).await);
        let state = manager.get_state("t1", "app", "u1").await.unwrap();
        assert_eq!(state.get("a"), Some(&json!("overwritten")));
    }

    #[tokio::test]
    async fn bulk_update_filters_by_app() {
        let (manager, _) = manager_with_store(config(1200, None));
        manager
            .get_or_create("app1", "t1", "u1", Map::new())
            .await
            .unwrap();
        manager
            .get_or_create("app2", "t2", "u1", Map::new())
            .await
            .unwrap();

        let mut delta = Map::new();
        delta.insert("k".into(), json!(1));
        let results = manager
            .bulk_update_user_state("u1", delta, Some("app1"))
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results.get("app1:t1"), Some(&true));
        assert!(manager.get_state("t2", "app2", "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ledger_accumulates_and_survives_queries() {
        let (manager, _) = manager_with_store(config(1200, None));
        manager.mark_messages_processed("app", "t1", vec!["m1".into(), "".into()]);
        manager.mark_messages_processed("app", "t1", vec!["m2".into(), "m1".into()]);

        let ids = manager.get_processed_message_ids("app", "t1");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("m1") && ids.contains("m2"));
        assert!(manager.get_processed_message_ids("app", "t2").is_empty());
    }

    #[tokio::test]
    async fn cleanup_expires_idle_sessions_and_archives() {
        let store = Arc::new(InMemorySessionStore::new());
        let memory = Arc::new(InMemoryMemoryStore::new());
        let manager = SessionManager::new(store.clone(), Some(memory.clone()), config(60, None));

        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();
        store.backdate("t1", "app", "u1", chrono::Duration::seconds(120));

        manager.run_cleanup_once().await;

        assert_eq!(manager.session_count(), 0);
        assert!(store.get("t1", "app", "u1").await.unwrap().is_none());
        assert_eq!(memory.archived_count(), 1);
        assert_eq!(memory.archived_session_keys(), vec!["app:t1".to_string()]);
    }

    #[tokio::test]
    async fn cleanup_preserves_sessions_with_pending_tool_calls() {
        let (manager, store) = manager_with_store(config(60, None));
        let mut state = Map::new();
        state.insert(PENDING_TOOL_CALLS_KEY.into(), json!(["c1"]));
        manager
            .get_or_create("app", "t1", "u1", state)
            .await
            .unwrap();
        store.backdate("t1", "app", "u1", chrono::Duration::hours(2));

        manager.run_cleanup_once().await;

        assert_eq!(manager.session_count(), 1);
        assert!(store.get("t1", "app", "u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fresh_sessions_survive_cleanup() {
        let (manager, store) = manager_with_store(config(3600, None));
        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();

        manager.run_cleanup_once().await;

        assert_eq!(manager.session_count(), 1);
        assert!(store.get("t1", "app", "u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn metadata_lookup_cached_and_invalidated_on_delete() {
        let (manager, store) = manager_with_store(config(60, None));
        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();

        let meta = manager.session_metadata("t1").unwrap();
        assert_eq!(meta.app_name, "app");
        assert_eq!(meta.user_id, "u1");

        let session = store.get("t1", "app", "u1").await.unwrap().unwrap();
        manager.delete_session(&session).await;

        assert!(manager.session_metadata("t1").is_none());
    }

    #[tokio::test]
    async fn metadata_fallback_scan_populates_cache() {
        let (manager, _) = manager_with_store(config(60, None));
        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();
        // Simulate a pre-cache entry by clearing the cache only.
        manager.tracking.lock().metadata_cache.clear();

        let meta = manager.session_metadata("t1").unwrap();
        assert_eq!(meta.user_id, "u1");
        // Second lookup hits the repopulated cache.
        assert!(manager.tracking.lock().metadata_cache.contains_key("t1"));
    }

    #[tokio::test]
    async fn ledger_dropped_when_session_untracked() {
        let (manager, store) = manager_with_store(config(60, None));
        manager
            .get_or_create("app", "t1", "u1", Map::new())
            .await
            .unwrap();
        manager.mark_messages_processed("app", "t1", vec!["m1".into()]);

        let session = store.get("t1", "app", "u1").await.unwrap().unwrap();
        manager.delete_session(&session).await;

        assert!(manager.get_processed_message_ids("app", "t1").is_empty());
    }
}
