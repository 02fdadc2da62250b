//! Shape conversions between the wire protocol and the runtime protocol:
//! message history and content flattening.

use serde_json::{json, Value};
use uuid::Uuid;

use swb_domain::message::{FunctionDecl, InputMessage, MessageContent, ToolCallDecl};
use swb_domain::runtime::{Content, FunctionCall, FunctionResponse, Part, RuntimeEvent, ToolPayload};

/// Flatten optional message content to plain text.
pub fn flatten_message_content(content: Option<&MessageContent>) -> String {
    content.map(MessageContent::flatten_text).unwrap_or_default()
}

/// Convert wire-protocol history messages into runtime events.
///
/// Messages that cannot be converted (an assistant tool call whose
/// arguments fail to parse) are logged and skipped rather than aborting
/// the batch.
pub fn messages_to_runtime_events(messages: &[InputMessage]) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();

    for message in messages {
        let id = message
            .id()
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match message {
            InputMessage::User { content, .. } | InputMessage::System { content, .. } => {
                let mut event = RuntimeEvent::new(id, role_name(message));
                let text = flatten_message_content(content.as_ref());
                if !text.is_empty() {
                    event.content = Some(Content {
                        role: role_name(message).to_owned(),
                        parts: vec![Part::Text(text)],
                    });
                }
                events.push(event);
            }
            InputMessage::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut parts = Vec::new();
                let text = flatten_message_content(content.as_ref());
                if !text.is_empty() {
                    parts.push(Part::Text(text));
                }

                let mut parse_failed = false;
                for call in tool_calls {
                    match parse_arguments(&call.function.arguments) {
                        Ok(args) => parts.push(Part::FunctionCall(FunctionCall {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            args,
                        })),
                        Err(e) => {
                            tracing::error!(
                                message_id = %id,
                                tool_call_id = %call.id,
                                error = %e,
                                "skipping assistant message with unparseable tool-call arguments"
                            );
                            parse_failed = true;
                            break;
                        }
                    }
                }
                if parse_failed {
                    continue;
                }

                let mut event = RuntimeEvent::new(id, "assistant");
                if !parts.is_empty() {
                    // The runtime names the assistant side "model".
                    event.content = Some(Content {
                        role: "model".to_owned(),
                        parts,
                    });
                }
                events.push(event);
            }
            InputMessage::Tool {
                tool_call_id,
                content,
                ..
            } => {
                let mut event = RuntimeEvent::new(id, "tool");
                event.content = Some(Content {
                    role: "function".to_owned(),
                    parts: vec![Part::FunctionResponse(FunctionResponse {
                        id: tool_call_id.clone(),
                        name: tool_call_id.clone(),
                        response: ToolPayload::Json(json!({ "result": content })),
                    })],
                });
                events.push(event);
            }
        }
    }

    events
}

fn role_name(message: &InputMessage) -> &'static str {
    match message {
        InputMessage::User { .. } => "user",
        InputMessage::Assistant { .. } => "assistant",
        InputMessage::System { .. } => "system",
        InputMessage::Tool { .. } => "tool",
    }
}

fn parse_arguments(arguments: &str) -> serde_json::Result<Value> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments)
}

/// Convert a runtime event back into a wire-protocol message, when it has
/// a message-shaped payload.
pub fn runtime_event_to_message(event: &RuntimeEvent) -> Option<InputMessage> {
    let content = event.content.as_ref()?;
    if content.parts.is_empty() {
        return None;
    }

    if event.author == "user" {
        let text = join_text_parts(content);
        if text.is_empty() {
            return None;
        }
        return Some(InputMessage::User {
            id: Some(event.id.clone()),
            content: Some(MessageContent::Text(text)),
        });
    }

    let text = join_text_parts(content);
    let tool_calls: Vec<ToolCallDecl> = content
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::FunctionCall(call) => Some(ToolCallDecl {
                id: call.id.clone(),
                function: FunctionDecl {
                    name: call.name.clone(),
                    arguments: serde_json::to_string(&call.args)
                        .unwrap_or_else(|_| "{}".to_owned()),
                },
            }),
            _ => None,
        })
        .collect();

    Some(InputMessage::Assistant {
        id: Some(event.id.clone()),
        content: (!text.is_empty()).then_some(MessageContent::Text(text)),
        tool_calls,
    })
}

fn join_text_parts(content: &Content) -> String {
    content
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text(text) if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract all text from runtime content, newline-joined.
pub fn extract_text_from_content(content: &Content) -> String {
    join_text_parts(content)
}

/// The latest user message as runtime content, if any.
pub fn latest_user_message(messages: &[InputMessage]) -> Option<Content> {
    messages.iter().rev().find_map(|message| match message {
        InputMessage::User {
            content: Some(content),
            ..
        } => {
            let text = content.flatten_text();
            if text.is_empty() {
                None
            } else {
                Some(Content {
                    role: "user".to_owned(),
                    parts: vec![Part::Text(text)],
                })
            }
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_message_converts_with_tool_calls() {
        let message = InputMessage::assistant(
            "a1",
            Some("checking".into()),
            vec![ToolCallDecl {
                id: "c1".into(),
                function: FunctionDecl {
                    name: "search".into(),
                    arguments: r#"{"q": "rust"}"#.into(),
                },
            }],
        );

        let events = messages_to_runtime_events(&[message]);
        assert_eq!(events.len(), 1);
        let calls = events[0].function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].args, json!({"q": "rust"}));
        assert_eq!(events[0].combined_text(), "checking");
    }

    #[test]
    fn assistant_message_with_bad_arguments_is_skipped() {
        let good = InputMessage::user("u1", "hello");
        let bad = InputMessage::assistant(
            "a1",
            None,
            vec![ToolCallDecl {
                id: "c1".into(),
                function: FunctionDecl {
                    name: "search".into(),
                    arguments: "not json".into(),
                },
            }],
        );

        let events = messages_to_runtime_events(&[good, bad]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].author, "user");
    }

    #[test]
    fn tool_message_becomes_function_response() {
        let message = InputMessage::tool("t1", "c1", "it worked");
        let events = messages_to_runtime_events(&[message]);

        let responses = events[0].function_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, "c1");
        assert_eq!(
            responses[0].response,
            ToolPayload::Json(json!({"result": "it worked"}))
        );
    }

    #[test]
    fn runtime_event_roundtrips_to_assistant_message() {
        let mut event = RuntimeEvent::new("e1", "model");
        event.content = Some(Content {
            role: "model".into(),
            parts: vec![
                Part::Text("answer".into()),
                Part::FunctionCall(FunctionCall {
                    id: "c1".into(),
                    name: "lookup".into(),
                    args: json!({"k": 1}),
                }),
            ],
        });

        let message = runtime_event_to_message(&event).unwrap();
        let InputMessage::Assistant {
            id,
            content,
            tool_calls,
        } = message
        else {
            panic!("expected assistant message");
        };
        assert_eq!(id.as_deref(), Some("e1"));
        assert_eq!(content.unwrap().flatten_text(), "answer");
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].function.arguments, r#"{"k":1}"#);
    }

    #[test]
    fn latest_user_message_picks_the_last_user_text() {
        let messages = vec![
            InputMessage::user("u1", "first"),
            InputMessage::assistant("a1", Some("reply".into()), vec![]),
            InputMessage::user("u2", "second"),
            InputMessage::tool("t1", "c1", "{}"),
        ];

        let content = latest_user_message(&messages).unwrap();
        assert_eq!(extract_text_from_content(&content), "second");
    }

    #[test]
    fn latest_user_message_none_without_user_text() {
        let messages = vec![InputMessage::tool("t1", "c1", "{}")];
        assert!(latest_user_message(&messages).is_none());
    }
}
