//! Injected capability interfaces: the stores and the agent runner the
//! bridge consumes but does not implement.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::AgentHandle;
use crate::error::Result;
use crate::runtime::{Content, RunConfig, RuntimeEvent};
use crate::stream::BoxStream;

/// State key holding the tool-call ids awaiting a client result.
pub const PENDING_TOOL_CALLS_KEY: &str = "pending_tool_calls";

/// A conversation session as held by the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub state: Map<String, Value>,
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    /// Canonical registry index: `"{app_name}:{session_id}"`.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.app_name, self.id)
    }

    /// Tool-call ids awaiting a client-side result.
    pub fn pending_tool_calls(&self) -> Vec<String> {
        match self.state.get(PENDING_TOOL_CALLS_KEY) {
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A synthetic event appended to a session to mutate its state.
///
/// A `Null` delta value removes the key; anything else inserts or
/// replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub invocation_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub state_delta: Map<String, Value>,
}

impl SessionEvent {
    pub fn state_update(state_delta: Map<String, Value>) -> Self {
        Self {
            invocation_id: format!("state_update_{}", uuid::Uuid::new_v4()),
            author: "system".into(),
            timestamp: Utc::now(),
            state_delta,
        }
    }
}

/// Persistence backend for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
    ) -> Result<Option<Session>>;

    async fn create(
        &self,
        session_id: &str,
        app_name: &str,
        user_id: &str,
        state: Map<String, Value>,
    ) -> Result<Session>;

    async fn delete(&self, session_id: &str, app_name: &str, user_id: &str) -> Result<()>;

    async fn append_event(&self, session: &Session, event: SessionEvent) -> Result<()>;
}

/// Long-term memory a session is archived to before deletion.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add_session(&self, session: &Session) -> Result<()>;
}

/// File/blob storage, passed through to the runner untouched.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, session_id: &str, name: &str, data: Vec<u8>) -> Result<()>;

    async fn load(&self, session_id: &str, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Credential storage, passed through to the runner untouched.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, secret: String) -> Result<()>;
}

/// Everything a runner needs to execute the agent.
#[derive(Clone)]
pub struct RunnerContext {
    pub agent: AgentHandle,
    pub app_name: String,
    pub session_store: Arc<dyn SessionStore>,
    pub artifact_store: Option<Arc<dyn ArtifactStore>>,
    pub memory_store: Option<Arc<dyn MemoryStore>>,
    pub credential_store: Option<Arc<dyn CredentialStore>>,
}

/// The agent runtime itself.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Execute one turn and stream back runtime events.
    async fn run_stream(
        &self,
        user_id: &str,
        session_id: &str,
        new_message: Option<Content>,
        run_config: &RunConfig,
    ) -> Result<BoxStream<'static, Result<RuntimeEvent>>>;

    /// Release runner resources.  Failures are logged and swallowed by the
    /// caller.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds a runner per background execution.
pub trait RunnerFactory: Send + Sync {
    fn create(&self, ctx: RunnerContext) -> Result<Box<dyn AgentRunner>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_key_format() {
        let session = Session {
            id: "t1".into(),
            app_name: "app".into(),
            user_id: "u1".into(),
            state: Map::new(),
            last_update_time: Utc::now(),
        };
        assert_eq!(session.session_key(), "app:t1");
    }

    #[test]
    fn pending_tool_calls_reads_state_key() {
        let mut state = Map::new();
        state.insert(PENDING_TOOL_CALLS_KEY.into(), json!(["c1", "c2"]));
        let session = Session {
            id: "t1".into(),
            app_name: "app".into(),
            user_id: "u1".into(),
            state,
            last_update_time: Utc::now(),
        };
        assert_eq!(session.pending_tool_calls(), vec!["c1", "c2"]);
    }

    #[test]
    fn pending_tool_calls_empty_when_absent_or_malformed() {
        let mut state = Map::new();
        state.insert(PENDING_TOOL_CALLS_KEY.into(), json!("not a list"));
        let session = Session {
            id: "t1".into(),
            app_name: "app".into(),
            user_id: "u1".into(),
            state,
            last_update_time: Utc::now(),
        };
        assert!(session.pending_tool_calls().is_empty());
    }
}
