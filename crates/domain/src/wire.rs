//! The client-facing wire protocol: one structured request in, a totally
//! ordered stream of events out.
//!
//! Event shapes follow the streaming-UI convention: a SCREAMING_SNAKE
//! `type` tag, camelCase fields, text messages bracketed by START/END,
//! tool calls bracketed by START/ARGS/END.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{InputMessage, ToolDefinition};

/// A run request describing the current state of one conversational thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInput {
    pub thread_id: String,
    pub run_id: String,
    /// Client-declared thread state (the client is the source of truth).
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub messages: Vec<InputMessage>,
    /// Tools the client can execute on its side.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

impl RunInput {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            state: Value::Null,
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// Events emitted to the client during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum WireEvent {
    RunStarted {
        thread_id: String,
        run_id: String,
    },
    RunFinished {
        thread_id: String,
        run_id: String,
    },
    RunError {
        message: String,
        code: String,
    },
    TextMessageStart {
        message_id: String,
        role: String,
    },
    TextMessageContent {
        message_id: String,
        delta: String,
    },
    TextMessageEnd {
        message_id: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    ToolCallArgs {
        tool_call_id: String,
        delta: String,
    },
    ToolCallEnd {
        tool_call_id: String,
    },
    ToolCallResult {
        message_id: String,
        tool_call_id: String,
        content: String,
    },
    StateDelta {
        /// RFC 6902 patch operations.
        delta: Vec<Value>,
    },
    StateSnapshot {
        snapshot: Value,
    },
    Custom {
        name: String,
        value: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_tags_are_screaming_snake() {
        let ev = WireEvent::TextMessageStart {
            message_id: "m1".into(),
            role: "assistant".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "TEXT_MESSAGE_START");
        assert_eq!(json["messageId"], "m1");
    }

    #[test]
    fn tool_call_start_omits_missing_parent() {
        let ev = WireEvent::ToolCallStart {
            tool_call_id: "c1".into(),
            tool_call_name: "search".into(),
            parent_message_id: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "TOOL_CALL_START");
        assert_eq!(json["toolCallName"], "search");
        assert!(json.get("parentMessageId").is_none());
    }

    #[test]
    fn run_input_defaults_optional_fields() {
        let input: RunInput =
            serde_json::from_str(r#"{"thread_id": "t1", "run_id": "r1"}"#).unwrap();
        assert!(input.messages.is_empty());
        assert!(input.tools.is_empty());
        assert!(input.state.is_null());
    }
}
