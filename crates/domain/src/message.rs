use serde::{Deserialize, Serialize};

/// Tool definition declared by the client alongside a run request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A tool call recorded on an assistant message in the input history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDecl {
    pub id: String,
    pub function: FunctionDecl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A message in the thread the client submits with each request.
///
/// Ids are optional — a message without an id is always treated as unseen
/// by the dedup ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum InputMessage {
    User {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        content: Option<MessageContent>,
    },
    Assistant {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        content: Option<MessageContent>,
        #[serde(default)]
        tool_calls: Vec<ToolCallDecl>,
    },
    System {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        content: Option<MessageContent>,
    },
    Tool {
        #[serde(default)]
        id: Option<String>,
        tool_call_id: String,
        /// Serialized (usually JSON) tool output.
        #[serde(default)]
        content: String,
    },
}

impl InputMessage {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::User { id, .. }
            | Self::Assistant { id, .. }
            | Self::System { id, .. }
            | Self::Tool { id, .. } => id.as_deref(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::System { .. } => Role::System,
            Self::Tool { .. } => Role::Tool,
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }

    pub fn content(&self) -> Option<&MessageContent> {
        match self {
            Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::System { content, .. } => content.as_ref(),
            Self::Tool { .. } => None,
        }
    }

    // ── Convenience constructors ───────────────────────────────────

    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::User {
            id: Some(id.into()),
            content: Some(MessageContent::Text(text.into())),
        }
    }

    pub fn assistant(
        id: impl Into<String>,
        text: Option<String>,
        tool_calls: Vec<ToolCallDecl>,
    ) -> Self {
        Self::Assistant {
            id: Some(id.into()),
            content: text.map(MessageContent::Text),
            tool_calls,
        }
    }

    pub fn system(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::System {
            id: Some(id.into()),
            content: Some(MessageContent::Text(text.into())),
        }
    }

    pub fn tool(
        id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            id: Some(id.into()),
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }
}

/// Message content: plain text or a list of structured parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<InputContent>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InputContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "binary")]
    Binary {
        mime_type: String,
        /// Base64-encoded payload.
        data: String,
    },
}

impl MessageContent {
    /// Flatten to plain text.  Text parts are joined with `"\n"`; binary
    /// parts are skipped.
    pub fn flatten_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    InputContent::Text { text } if !text.is_empty() => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_text_variant() {
        let content = MessageContent::Text("hello".into());
        assert_eq!(content.flatten_text(), "hello");
    }

    #[test]
    fn flatten_parts_skips_binary() {
        let content = MessageContent::Parts(vec![
            InputContent::Text {
                text: "line one".into(),
            },
            InputContent::Binary {
                mime_type: "image/png".into(),
                data: "aGk=".into(),
            },
            InputContent::Text {
                text: "line two".into(),
            },
        ]);
        assert_eq!(content.flatten_text(), "line one\nline two");
    }

    #[test]
    fn message_roundtrips_through_json() {
        let msg = InputMessage::tool("t1", "c1", r#"{"r":42}"#);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "c1");
        let back: InputMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.id(), Some("t1"));
        assert!(back.is_tool());
    }

    #[test]
    fn message_without_id_deserializes() {
        let msg: InputMessage =
            serde_json::from_str(r#"{"role": "user", "content": "hi"}"#).unwrap();
        assert_eq!(msg.id(), None);
        assert_eq!(msg.role(), Role::User);
    }
}
