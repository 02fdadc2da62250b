use serde::Serialize;

/// Structured trace events emitted across all Switchboard crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_key: String,
        user_id: String,
    },
    SessionEvicted {
        session_key: String,
        user_id: String,
        reason: String,
    },
    SessionExpired {
        session_key: String,
        age_secs: i64,
    },
    SessionPreserved {
        session_key: String,
        pending_tool_calls: usize,
    },
    RunDispatched {
        thread_id: String,
        run_id: String,
        unseen_messages: usize,
    },
    ExecutionSpawned {
        thread_id: String,
    },
    ExecutionStale {
        thread_id: String,
    },
    ToolCallPending {
        thread_id: String,
        tool_call_id: String,
    },
    ToolResultSubmitted {
        thread_id: String,
        tool_call_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "swb_event");
    }
}
