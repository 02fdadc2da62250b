//! The runtime-facing protocol: events consumed from the injected agent
//! runtime, and the input shapes handed to it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One event from the agent runtime's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: String,
    /// Originating author ("user" events are replayed history and skipped).
    pub author: String,
    #[serde(default)]
    pub content: Option<Content>,
    /// True for an incremental streaming chunk.
    #[serde(default)]
    pub partial: bool,
    /// True once the runtime considers the turn complete.
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Tool-call ids whose execution is performed by the client.
    #[serde(default)]
    pub long_running_tool_ids: Vec<String>,
    #[serde(default)]
    pub actions: Option<EventActions>,
    #[serde(default)]
    pub custom_data: Option<Value>,
}

impl RuntimeEvent {
    pub fn new(id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            content: None,
            partial: false,
            turn_complete: false,
            finish_reason: None,
            long_running_tool_ids: Vec::new(),
            actions: None,
            custom_data: None,
        }
    }

    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.content
            .iter()
            .flat_map(|c| &c.parts)
            .filter_map(|p| match p {
                Part::FunctionCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        self.content
            .iter()
            .flat_map(|c| &c.parts)
            .filter_map(|p| match p {
                Part::FunctionResponse(resp) => Some(resp),
                _ => None,
            })
            .collect()
    }

    /// Whether this event is the runtime's final word for the turn.
    ///
    /// An event announcing long-running (client-side) tool calls is always
    /// final: the runtime suspends until the client responds.  Otherwise an
    /// event is final when it is not partial and carries no function
    /// traffic.
    pub fn is_final_response(&self) -> bool {
        if !self.long_running_tool_ids.is_empty() {
            return true;
        }
        self.function_calls().is_empty() && self.function_responses().is_empty() && !self.partial
    }

    /// Concatenated text of all text parts.
    pub fn combined_text(&self) -> String {
        self.content
            .iter()
            .flat_map(|c| &c.parts)
            .filter_map(|p| match p {
                Part::Text(t) if !t.is_empty() => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Message content exchanged with the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    /// Argument object.
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: ToolPayload,
}

/// State changes attached to a runtime event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventActions {
    #[serde(default)]
    pub state_delta: Map<String, Value>,
    #[serde(default)]
    pub state_snapshot: Option<Value>,
}

/// The heterogeneous value a runtime tool may hand back.
///
/// Tools are written by integrators; the bridge serializes whatever shape
/// arrives, including raw bytes and nested structures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolPayload {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<ToolPayload>),
    Map(Vec<(String, ToolPayload)>),
    /// Pre-built JSON, passed through untouched.
    Json(Value),
}

impl From<Value> for ToolPayload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Streaming behavior requested from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    None,
    #[default]
    Sse,
    Bidi,
}

/// Per-run configuration handed to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub streaming: StreamingMode,
    pub save_input_blobs_as_artifacts: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingMode::Sse,
            save_input_blobs_as_artifacts: true,
        }
    }
}
