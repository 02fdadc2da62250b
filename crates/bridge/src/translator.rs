//! Stateful translator from runtime events to wire events.
//!
//! Maintains the streaming-text state machine and enforces the wire
//! protocol's ordering rules: a text message is always closed before any
//! tool-call event, every START gets exactly one END, and a final payload
//! repeating just-streamed content is suppressed instead of re-sent.

use std::collections::HashSet;

use serde_json::{Map, Value};
use uuid::Uuid;

use swb_domain::runtime::{FunctionCall, FunctionResponse, RuntimeEvent, ToolPayload};
use swb_domain::wire::WireEvent;

/// Name used for custom events carrying runtime metadata.
const CUSTOM_EVENT_NAME: &str = "runtime_metadata";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-response serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Coerce a heterogeneous tool payload into plain JSON.
///
/// Primitives pass through; byte payloads decode as UTF-8 with a
/// byte-list fallback; lists and maps recurse; pre-built JSON is untouched.
fn coerce_tool_payload(payload: &ToolPayload) -> Value {
    match payload {
        ToolPayload::Null => Value::Null,
        ToolPayload::Bool(b) => Value::Bool(*b),
        ToolPayload::Number(n) => Value::Number(n.clone()),
        ToolPayload::Text(t) => Value::String(t.clone()),
        ToolPayload::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_owned()),
            Err(_) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        },
        ToolPayload::List(items) => Value::Array(items.iter().map(coerce_tool_payload).collect()),
        ToolPayload::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), coerce_tool_payload(value));
            }
            Value::Object(map)
        }
        ToolPayload::Json(value) => value.clone(),
    }
}

/// Serialize a tool response for the wire.  Never fails: an encoding error
/// degrades to the payload's debug form, and failing that to `""`.
pub fn serialize_tool_response(payload: &ToolPayload) -> String {
    let coerced = coerce_tool_payload(payload);
    match serde_json::to_string(&coerced) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode tool response, degrading to debug form");
            serde_json::to_string(&format!("{payload:?}"))
                .unwrap_or_else(|_| "\"\"".to_owned())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event translator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One translator instance per background execution.
#[derive(Default)]
pub struct EventTranslator {
    /// Wire message id of the currently open text stream.
    streaming_message_id: Option<String>,
    is_streaming: bool,
    /// Accumulated text of the active stream.
    current_stream_text: String,
    /// Snapshot of the most recently closed stream, for duplicate
    /// suppression when the runtime re-sends the full text as its final
    /// payload.
    last_streamed_text: Option<String>,
    last_streamed_run_id: Option<String>,
    /// Tool-call ids mid-triplet.
    active_tool_calls: HashSet<String>,
    /// Tool-call ids known to be executed by the client.
    long_running_tool_ids: Vec<String>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn long_running_tool_ids(&self) -> &[String] {
        &self.long_running_tool_ids
    }

    /// Translate one runtime event into wire events, in order.
    pub fn translate(&mut self, event: &RuntimeEvent, run_id: &str) -> Vec<WireEvent> {
        let mut out = Vec::new();

        // User events are replayed history, already in the conversation.
        if event.author == "user" {
            tracing::debug!(event_id = %event.id, "skipping user event");
            return out;
        }

        let has_parts = event.content.as_ref().is_some_and(|c| !c.parts.is_empty());
        if has_parts {
            self.translate_text(event, run_id, &mut out);
        }

        let function_calls = event.function_calls();
        if !function_calls.is_empty() {
            let lro_ids: HashSet<&str> = event
                .long_running_tool_ids
                .iter()
                .map(String::as_str)
                .collect();
            let non_lro: Vec<&FunctionCall> = function_calls
                .into_iter()
                .filter(|call| !lro_ids.contains(call.id.as_str()))
                .collect();

            if !non_lro.is_empty() {
                // A text message must be closed before any tool-call event.
                out.extend(self.force_close_streaming_message());
                self.translate_function_calls(&non_lro, &mut out);
            }
        }

        let responses = event.function_responses();
        if !responses.is_empty() {
            self.translate_function_responses(&responses, &mut out);
        }

        if let Some(actions) = &event.actions {
            if !actions.state_delta.is_empty() {
                out.push(state_delta_event(&actions.state_delta));
            }
            if let Some(snapshot) = &actions.state_snapshot {
                out.push(WireEvent::StateSnapshot {
                    snapshot: snapshot.clone(),
                });
            }
        }

        if let Some(custom) = &event.custom_data {
            out.push(WireEvent::Custom {
                name: CUSTOM_EVENT_NAME.into(),
                value: custom.clone(),
            });
        }

        out
    }

    // ── Text state machine ─────────────────────────────────────────

    fn translate_text(&mut self, event: &RuntimeEvent, run_id: &str, out: &mut Vec<WireEvent>) {
        let is_final = event.is_final_response();
        let combined = event.combined_text();

        // An empty non-final chunk carries nothing; an empty final event is
        // still a valid stream-closing signal.
        if combined.is_empty() && !is_final {
            return;
        }

        let has_finish_reason = event.finish_reason.is_some();
        let should_end = (event.turn_complete && !event.partial)
            || (has_finish_reason && self.is_streaming);

        if is_final {
            // A stream is open: close it.  The streamed content already
            // went out, so the final payload is not re-emitted.
            if self.is_streaming {
                if let Some(message_id) = self.streaming_message_id.take() {
                    if !self.current_stream_text.is_empty() {
                        self.last_streamed_text =
                            Some(std::mem::take(&mut self.current_stream_text));
                        self.last_streamed_run_id = Some(run_id.to_owned());
                    }
                    self.current_stream_text.clear();
                    out.push(WireEvent::TextMessageEnd { message_id });
                    self.is_streaming = false;
                    tracing::debug!("stream closed by final response");
                    return;
                }
            }

            // No open stream: this event carries the whole message.  Send
            // it unless it duplicates the stream that just closed in this
            // same run.
            let is_duplicate = self.last_streamed_run_id.as_deref() == Some(run_id)
                && self
                    .last_streamed_text
                    .as_deref()
                    .is_some_and(|last| last == combined);

            if is_duplicate {
                tracing::debug!(event_id = %event.id, "suppressing duplicate final payload");
            } else {
                out.push(WireEvent::TextMessageStart {
                    message_id: event.id.clone(),
                    role: "assistant".into(),
                });
                out.push(WireEvent::TextMessageContent {
                    message_id: event.id.clone(),
                    delta: combined,
                });
                out.push(WireEvent::TextMessageEnd {
                    message_id: event.id.clone(),
                });
            }

            self.current_stream_text.clear();
            self.last_streamed_text = None;
            self.last_streamed_run_id = None;
            return;
        }

        // Streaming chunk.
        if !self.is_streaming {
            let message_id = Uuid::new_v4().to_string();
            self.streaming_message_id = Some(message_id.clone());
            self.is_streaming = true;
            self.current_stream_text.clear();
            out.push(WireEvent::TextMessageStart {
                message_id,
                role: "assistant".into(),
            });
        }

        let Some(message_id) = self.streaming_message_id.clone() else {
            return;
        };

        if !combined.is_empty() {
            self.current_stream_text.push_str(&combined);
            out.push(WireEvent::TextMessageContent {
                message_id: message_id.clone(),
                delta: combined,
            });
        }

        if should_end {
            out.push(WireEvent::TextMessageEnd { message_id });
            if !self.current_stream_text.is_empty() {
                self.last_streamed_text = Some(std::mem::take(&mut self.current_stream_text));
                self.last_streamed_run_id = Some(run_id.to_owned());
            }
            self.current_stream_text.clear();
            self.streaming_message_id = None;
            self.is_streaming = false;
        }
    }

    // ── Tool calls ─────────────────────────────────────────────────

    fn translate_function_calls(&mut self, calls: &[&FunctionCall], out: &mut Vec<WireEvent>) {
        for call in calls {
            self.active_tool_calls.insert(call.id.clone());

            out.push(WireEvent::ToolCallStart {
                tool_call_id: call.id.clone(),
                tool_call_name: call.name.clone(),
                parent_message_id: None,
            });
            out.push(WireEvent::ToolCallArgs {
                tool_call_id: call.id.clone(),
                delta: encode_args(&call.args),
            });
            out.push(WireEvent::ToolCallEnd {
                tool_call_id: call.id.clone(),
            });

            self.active_tool_calls.remove(&call.id);
        }
    }

    /// Translate the long-running (client-side) function call announced by
    /// this event.  The caller stops feeding further runtime events once
    /// the closing `TOOL_CALL_END` goes out — completion arrives as a
    /// separate wire request.
    pub fn translate_lro_function_calls(&mut self, event: &RuntimeEvent) -> Vec<WireEvent> {
        let mut out = Vec::new();

        for call in event.function_calls() {
            if !event.long_running_tool_ids.contains(&call.id) {
                continue;
            }
            self.long_running_tool_ids.push(call.id.clone());

            out.push(WireEvent::ToolCallStart {
                tool_call_id: call.id.clone(),
                tool_call_name: call.name.clone(),
                parent_message_id: None,
            });
            out.push(WireEvent::ToolCallArgs {
                tool_call_id: call.id.clone(),
                delta: encode_args(&call.args),
            });
            out.push(WireEvent::ToolCallEnd {
                tool_call_id: call.id.clone(),
            });

            self.active_tool_calls.remove(&call.id);
            break;
        }

        out
    }

    fn translate_function_responses(
        &mut self,
        responses: &[&FunctionResponse],
        out: &mut Vec<WireEvent>,
    ) {
        for response in responses {
            // Client-side tool results arrive from the client, not the
            // runtime; re-emitting them here would double-deliver.
            if self.long_running_tool_ids.contains(&response.id) {
                tracing::debug!(tool_call_id = %response.id, "skipping result for long-running tool");
                continue;
            }
            out.push(WireEvent::ToolCallResult {
                message_id: Uuid::new_v4().to_string(),
                tool_call_id: response.id.clone(),
                content: serialize_tool_response(&response.response),
            });
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Close any open text stream.  Idempotent.
    pub fn force_close_streaming_message(&mut self) -> Vec<WireEvent> {
        let mut out = Vec::new();
        if self.is_streaming {
            if let Some(message_id) = self.streaming_message_id.take() {
                tracing::warn!(%message_id, "force-closing unterminated text stream");
                out.push(WireEvent::TextMessageEnd { message_id });
                self.current_stream_text.clear();
                self.is_streaming = false;
            }
        }
        out
    }

    /// Wipe all translator state between conversations.
    pub fn reset(&mut self) {
        self.active_tool_calls.clear();
        self.streaming_message_id = None;
        self.is_streaming = false;
        self.current_stream_text.clear();
        self.last_streamed_text = None;
        self.last_streamed_run_id = None;
        self.long_running_tool_ids.clear();
    }
}

fn encode_args(args: &Value) -> String {
    if args.is_null() {
        return "{}".to_owned();
    }
    serde_json::to_string(args).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to encode tool-call args");
        "{}".to_owned()
    })
}

/// State delta as RFC 6902 patches.  `add` works for both new and existing
/// paths.
fn state_delta_event(delta: &Map<String, Value>) -> WireEvent {
    let patches = delta
        .iter()
        .map(|(key, value)| {
            serde_json::json!({
                "op": "add",
                "path": format!("/{key}"),
                "value": value,
            })
        })
        .collect();
    WireEvent::StateDelta { delta: patches }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swb_domain::runtime::{Content, EventActions, Part};

    fn chunk(id: &str, text: &str) -> RuntimeEvent {
        let mut ev = RuntimeEvent::new(id, "model");
        ev.partial = true;
        ev.content = Some(Content {
            role: "model".into(),
            parts: vec![Part::Text(text.into())],
        });
        ev
    }

    fn final_text(id: &str, text: &str) -> RuntimeEvent {
        let mut ev = RuntimeEvent::new(id, "model");
        ev.turn_complete = true;
        ev.content = Some(Content {
            role: "model".into(),
            parts: vec![Part::Text(text.into())],
        });
        ev
    }

    fn call_event(id: &str, call_id: &str, name: &str, long_running: bool) -> RuntimeEvent {
        let mut ev = RuntimeEvent::new(id, "model");
        ev.content = Some(Content {
            role: "model".into(),
            parts: vec![Part::FunctionCall(FunctionCall {
                id: call_id.into(),
                name: name.into(),
                args: json!({}),
            })],
        });
        if long_running {
            ev.long_running_tool_ids = vec![call_id.into()];
        }
        ev
    }

    #[test]
    fn streaming_chunks_open_one_message() {
        let mut tr = EventTranslator::new();
        let first = tr.translate(&chunk("e1", "Hel"), "r1");
        let second = tr.translate(&chunk("e2", "lo"), "r1");

        assert!(matches!(first[0], WireEvent::TextMessageStart { .. }));
        assert!(matches!(
            &first[1],
            WireEvent::TextMessageContent { delta, .. } if delta == "Hel"
        ));
        // The second chunk continues the same message, no new START.
        assert_eq!(second.len(), 1);
        assert!(matches!(
            &second[0],
            WireEvent::TextMessageContent { delta, .. } if delta == "lo"
        ));
    }

    #[test]
    fn final_response_closes_stream_without_reemitting() {
        let mut tr = EventTranslator::new();
        tr.translate(&chunk("e1", "Hello"), "r1");
        let events = tr.translate(&final_text("e2", "Hello"), "r1");

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WireEvent::TextMessageEnd { .. }));
    }

    #[test]
    fn duplicate_final_payload_after_closed_stream_is_suppressed() {
        let mut tr = EventTranslator::new();
        tr.translate(&chunk("e1", "Hello"), "r1");
        // An empty final event closes the active stream.
        tr.translate(&final_text("e2", ""), "r1");

        // The runtime repeats the whole text as a final payload.
        let events = tr.translate(&final_text("e3", "Hello"), "r1");
        assert!(events.is_empty());
    }

    #[test]
    fn repeated_text_in_a_different_run_is_not_suppressed() {
        let mut tr = EventTranslator::new();
        tr.translate(&chunk("e1", "Hello"), "r1");
        tr.translate(&final_text("e2", ""), "r1");

        let events = tr.translate(&final_text("e3", "Hello"), "r2");
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn final_without_stream_emits_complete_triplet_with_event_id() {
        let mut tr = EventTranslator::new();
        let events = tr.translate(&final_text("e9", "All at once"), "r1");

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            WireEvent::TextMessageStart { message_id, role }
                if message_id == "e9" && role == "assistant"
        ));
        assert!(matches!(
            &events[1],
            WireEvent::TextMessageContent { delta, .. } if delta == "All at once"
        ));
        assert!(matches!(
            &events[2],
            WireEvent::TextMessageEnd { message_id } if message_id == "e9"
        ));
    }

    #[test]
    fn finish_reason_ends_open_stream() {
        let mut tr = EventTranslator::new();
        tr.translate(&chunk("e1", "partial"), "r1");

        let mut ev = chunk("e2", " more");
        ev.finish_reason = Some("stop".into());
        let events = tr.translate(&ev, "r1");

        assert!(matches!(
            events.last(),
            Some(WireEvent::TextMessageEnd { .. })
        ));
    }

    #[test]
    fn function_call_force_closes_open_text() {
        let mut tr = EventTranslator::new();
        tr.translate(&chunk("e1", "Let me check"), "r1");

        let events = tr.translate(&call_event("e2", "c1", "lookup", false), "r1");

        assert!(matches!(events[0], WireEvent::TextMessageEnd { .. }));
        assert!(matches!(
            &events[1],
            WireEvent::ToolCallStart { tool_call_id, tool_call_name, .. }
                if tool_call_id == "c1" && tool_call_name == "lookup"
        ));
        assert!(matches!(
            &events[2],
            WireEvent::ToolCallArgs { delta, .. } if delta == "{}"
        ));
        assert!(matches!(&events[3], WireEvent::ToolCallEnd { .. }));
        assert!(tr.active_tool_calls.is_empty());
    }

    #[test]
    fn args_always_emitted_with_encoded_object() {
        let mut tr = EventTranslator::new();
        let mut ev = call_event("e1", "c1", "lookup", false);
        ev.content = Some(Content {
            role: "model".into(),
            parts: vec![Part::FunctionCall(FunctionCall {
                id: "c1".into(),
                name: "lookup".into(),
                args: json!({"q": "rust"}),
            })],
        });
        let events = tr.translate(&ev, "r1");
        assert!(matches!(
            &events[1],
            WireEvent::ToolCallArgs { delta, .. } if delta == r#"{"q":"rust"}"#
        ));
    }

    #[test]
    fn lro_path_records_id_and_emits_triplet() {
        let mut tr = EventTranslator::new();
        let events = tr.translate_lro_function_calls(&call_event("e1", "c1", "search", true));

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], WireEvent::ToolCallStart { .. }));
        assert!(matches!(&events[2], WireEvent::ToolCallEnd { .. }));
        assert_eq!(tr.long_running_tool_ids(), &["c1".to_string()]);
    }

    #[test]
    fn lro_path_skips_non_long_running_calls() {
        let mut tr = EventTranslator::new();
        let events = tr.translate_lro_function_calls(&call_event("e1", "c1", "search", false));
        assert!(events.is_empty());
        assert!(tr.long_running_tool_ids().is_empty());
    }

    #[test]
    fn function_responses_skip_long_running_ids() {
        let mut tr = EventTranslator::new();
        tr.translate_lro_function_calls(&call_event("e1", "c1", "search", true));

        let mut ev = RuntimeEvent::new("e2", "model");
        ev.partial = true;
        ev.content = Some(Content {
            role: "model".into(),
            parts: vec![
                Part::FunctionResponse(FunctionResponse {
                    id: "c1".into(),
                    name: "search".into(),
                    response: ToolPayload::Json(json!({"ok": true})),
                }),
                Part::FunctionResponse(FunctionResponse {
                    id: "c2".into(),
                    name: "lookup".into(),
                    response: ToolPayload::Json(json!({"n": 1})),
                }),
            ],
        });

        let events = tr.translate(&ev, "r1");
        let results: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                WireEvent::ToolCallResult {
                    tool_call_id,
                    content,
                    ..
                } => Some((tool_call_id.clone(), content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "c2");
        assert_eq!(results[0].1, r#"{"n":1}"#);
    }

    #[test]
    fn state_delta_becomes_add_patches() {
        let mut tr = EventTranslator::new();
        let mut ev = RuntimeEvent::new("e1", "model");
        ev.partial = true;
        let mut delta = Map::new();
        delta.insert("color".into(), json!("blue"));
        ev.actions = Some(EventActions {
            state_delta: delta,
            state_snapshot: None,
        });

        let events = tr.translate(&ev, "r1");
        let WireEvent::StateDelta { delta } = &events[0] else {
            panic!("expected STATE_DELTA, got {events:?}");
        };
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0]["op"], "add");
        assert_eq!(delta[0]["path"], "/color");
        assert_eq!(delta[0]["value"], "blue");

        // Add patches with scalar values invert back to the source delta.
        let mut back = Map::new();
        for patch in delta {
            let key = patch["path"].as_str().unwrap().trim_start_matches('/');
            back.insert(key.to_owned(), patch["value"].clone());
        }
        assert_eq!(back.get("color"), Some(&json!("blue")));
    }

    #[test]
    fn state_snapshot_passes_through() {
        let mut tr = EventTranslator::new();
        let mut ev = RuntimeEvent::new("e1", "model");
        ev.partial = true;
        ev.actions = Some(EventActions {
            state_delta: Map::new(),
            state_snapshot: Some(json!({"color": "blue"})),
        });

        let events = tr.translate(&ev, "r1");
        assert!(matches!(
            &events[0],
            WireEvent::StateSnapshot { snapshot } if snapshot == &json!({"color": "blue"})
        ));
    }

    #[test]
    fn custom_data_emitted_with_runtime_metadata_name() {
        let mut tr = EventTranslator::new();
        let mut ev = RuntimeEvent::new("e1", "model");
        ev.partial = true;
        ev.custom_data = Some(json!({"trace": "abc"}));

        let events = tr.translate(&ev, "r1");
        assert!(matches!(
            &events[0],
            WireEvent::Custom { name, .. } if name == "runtime_metadata"
        ));
    }

    #[test]
    fn user_events_are_skipped() {
        let mut tr = EventTranslator::new();
        let mut ev = chunk("e1", "echo of history");
        ev.author = "user".into();
        assert!(tr.translate(&ev, "r1").is_empty());
    }

    #[test]
    fn force_close_is_idempotent() {
        let mut tr = EventTranslator::new();
        tr.translate(&chunk("e1", "open"), "r1");

        assert_eq!(tr.force_close_streaming_message().len(), 1);
        assert!(tr.force_close_streaming_message().is_empty());
    }

    #[test]
    fn reset_wipes_all_state() {
        let mut tr = EventTranslator::new();
        tr.translate(&chunk("e1", "text"), "r1");
        tr.translate_lro_function_calls(&call_event("e2", "c1", "search", true));

        tr.reset();

        assert!(!tr.is_streaming);
        assert!(tr.streaming_message_id.is_none());
        assert!(tr.long_running_tool_ids().is_empty());
        assert!(tr.last_streamed_text.is_none());
    }

    // ── Coercion ───────────────────────────────────────────────────

    #[test]
    fn bytes_decode_as_utf8() {
        let payload = ToolPayload::Bytes(b"hello".to_vec());
        assert_eq!(serialize_tool_response(&payload), r#""hello""#);
    }

    #[test]
    fn invalid_bytes_fall_back_to_byte_list() {
        let payload = ToolPayload::Bytes(vec![0xff, 0xfe]);
        assert_eq!(serialize_tool_response(&payload), "[255,254]");
    }

    #[test]
    fn nested_structures_recurse() {
        let payload = ToolPayload::Map(vec![
            ("name".into(), ToolPayload::Text("result".into())),
            (
                "rows".into(),
                ToolPayload::List(vec![
                    ToolPayload::Number(1.into()),
                    ToolPayload::Bytes(b"ok".to_vec()),
                ]),
            ),
        ]);
        assert_eq!(
            serialize_tool_response(&payload),
            r#"{"name":"result","rows":[1,"ok"]}"#
        );
    }

    #[test]
    fn prebuilt_json_passes_through() {
        let payload = ToolPayload::Json(json!({"a": [1, 2], "b": null}));
        assert_eq!(serialize_tool_response(&payload), r#"{"a":[1,2],"b":null}"#);
    }
}
