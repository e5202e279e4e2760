//! Consumer-side materialization of the event stream.
//!
//! A pure function from `(message list, events)` to a message list; the
//! renderer applies it incrementally, and buffered catch-up events are
//! applied in one batch so a reconnect does not churn the UI per event.
//!
//! Two races reach this layer and both are tolerated: `stream-abort` may
//! or may not carry usage, and a reconnect may deliver a finalized whole
//! message in place of a `stream-start` replay.

use mux_protocol::ChatEvent;
use mux_protocol::Message;
use mux_protocol::MessageId;
use mux_protocol::MessageMeta;
use mux_protocol::MessagePart;
use mux_protocol::Role;
#[cfg(test)]
use mux_protocol::ToolCallOutput;
use mux_protocol::ToolCallPart;
use serde_json::Value;

/// Apply a batch of events to a materialized list.
pub fn aggregate(mut messages: Vec<Message>, events: &[ChatEvent]) -> Vec<Message> {
    for event in events {
        apply_event(&mut messages, event);
    }
    messages
}

pub fn apply_event(messages: &mut Vec<Message>, event: &ChatEvent) {
    match event {
        ChatEvent::StreamStart {
            message_id, model, ..
        } => {
            // A replayed start for a message we already hold (reconnect)
            // restarts its materialization from scratch.
            messages.retain(|m| m.id != *message_id);
            messages.push(Message {
                id: *message_id,
                role: Role::Assistant,
                parts: Vec::new(),
                history_sequence: None,
                metadata: MessageMeta {
                    model: Some(model.clone()),
                    partial: true,
                    ..Default::default()
                },
                mux_metadata: None,
            });
        }
        ChatEvent::StreamDelta {
            message_id,
            delta,
            timestamp,
            ..
        } => with_message(messages, *message_id, |message| {
            if message.metadata.timestamp == 0 {
                message.metadata.timestamp = *timestamp;
            }
            if let Some(MessagePart::Text { text }) = message.parts.last_mut() {
                text.push_str(delta);
            } else {
                message.parts.push(MessagePart::text(delta.clone()));
            }
        }),
        ChatEvent::ReasoningDelta {
            message_id, delta, ..
        } => with_message(messages, *message_id, |message| {
            // Reasoning accumulates in its own part so the renderer can
            // fold it away.
            if let Some(MessagePart::Reasoning { text }) = message.parts.last_mut() {
                text.push_str(delta);
            } else {
                message.parts.push(MessagePart::Reasoning {
                    text: delta.clone(),
                });
            }
        }),
        ChatEvent::ReasoningEnd { .. } => {}
        ChatEvent::ToolCallStart {
            message_id,
            tool_call_id,
            tool_name,
        } => with_message(messages, *message_id, |message| {
            message.parts.push(MessagePart::ToolCall(ToolCallPart {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                input: Value::Null,
                output: None,
            }));
        }),
        ChatEvent::ToolCallDelta {
            message_id,
            tool_call_id,
            input_patch,
        } => with_message(messages, *message_id, |message| {
            if let Some(call) = tool_call_mut(message, tool_call_id) {
                patch_input(&mut call.input, input_patch);
            }
        }),
        ChatEvent::ToolCallEnd {
            message_id,
            tool_call_id,
            tool_name,
            output,
        } => with_message(messages, *message_id, |message| {
            match tool_call_mut(message, tool_call_id) {
                Some(call) => {
                    if call.output.is_none() {
                        call.output = Some(output.clone());
                    }
                }
                None => {
                    message.parts.push(MessagePart::ToolCall(ToolCallPart {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        input: Value::Null,
                        output: Some(output.clone()),
                    }));
                }
            }
        }),
        ChatEvent::StreamEnd {
            message_id,
            metadata,
        } => with_message(messages, *message_id, |message| {
            message.metadata.partial = false;
            message.metadata.usage = metadata.usage;
            message.metadata.duration_ms = Some(metadata.duration_ms);
            message.metadata.provider_metadata = metadata.provider_metadata.clone();
        }),
        ChatEvent::StreamAbort {
            message_id,
            metadata,
        } => with_message(messages, *message_id, |message| {
            message.metadata.partial = true;
            message.metadata.usage = metadata.usage;
            message.metadata.duration_ms = Some(metadata.duration_ms);
            message.metadata.error = metadata.error.clone();
            message.metadata.error_type = metadata.error_type;
        }),
        ChatEvent::StreamError {
            message_id,
            error,
            error_type,
        } => with_message(messages, *message_id, |message| {
            message.metadata.partial = true;
            message.metadata.error = Some(error.clone());
            message.metadata.error_type = Some(*error_type);
        }),
        ChatEvent::DeleteMessage { id } => {
            messages.retain(|m| m.id != *id);
        }
        ChatEvent::CaughtUp { .. } => {}
        ChatEvent::Message { message } => {
            // Upsert: a finalized whole message may arrive in place of (or
            // after) its streamed form.
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => messages.push(message.clone()),
            }
        }
    }
}

fn with_message(messages: &mut [Message], id: MessageId, apply: impl FnOnce(&mut Message)) {
    if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
        apply(message);
    }
}

fn tool_call_mut<'a>(message: &'a mut Message, tool_call_id: &str) -> Option<&'a mut ToolCallPart> {
    message.parts.iter_mut().find_map(|part| match part {
        MessagePart::ToolCall(call) if call.tool_call_id == tool_call_id => Some(call),
        _ => None,
    })
}

/// Splice a streamed JSON fragment onto the accumulated input. Until the
/// accumulated text parses, it is held as a raw string.
fn patch_input(input: &mut Value, fragment: &str) {
    let mut accumulated = match &mut *input {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    accumulated.push_str(fragment);
    *input = match serde_json::from_str::<Value>(&accumulated) {
        Ok(parsed) => parsed,
        Err(_) => Value::String(accumulated),
    };
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use mux_protocol::StreamAbortMeta;
    use mux_protocol::StreamEndMeta;
    use mux_protocol::StreamErrorType;
    use mux_protocol::Usage;
    use pretty_assertions::assert_eq;

    fn start(message_id: MessageId) -> ChatEvent {
        ChatEvent::StreamStart {
            message_id,
            history_sequence: 1,
            model: "openai/gpt-5".to_string(),
        }
    }

    fn delta(message_id: MessageId, text: &str) -> ChatEvent {
        ChatEvent::StreamDelta {
            message_id,
            delta: text.to_string(),
            tokens: None,
            timestamp: 42,
        }
    }

    #[test]
    fn deltas_build_a_partial_then_stream_end_seals_it() {
        let id = MessageId::new();
        let events = vec![
            start(id),
            delta(id, "hel"),
            delta(id, "lo"),
            ChatEvent::StreamEnd {
                message_id: id,
                metadata: StreamEndMeta {
                    usage: Some(Usage {
                        output_tokens: 2,
                        ..Default::default()
                    }),
                    duration_ms: 10,
                    provider_metadata: None,
                },
            },
        ];
        let messages = aggregate(Vec::new(), &events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "hello");
        assert!(!messages[0].metadata.partial);
        assert_eq!(messages[0].metadata.usage.unwrap().output_tokens, 2);
    }

    #[test]
    fn reasoning_accumulates_in_its_own_part() {
        let id = MessageId::new();
        let events = vec![
            start(id),
            ChatEvent::ReasoningDelta {
                message_id: id,
                delta: "thinking".to_string(),
                tokens: None,
            },
            ChatEvent::ReasoningEnd { message_id: id },
            delta(id, "answer"),
        ];
        let messages = aggregate(Vec::new(), &events);
        assert_eq!(messages[0].parts.len(), 2);
        assert!(matches!(
            &messages[0].parts[0],
            MessagePart::Reasoning { text } if text == "thinking"
        ));
        assert_eq!(messages[0].text(), "answer");
    }

    #[test]
    fn tool_call_lifecycle_patches_input_and_attaches_result() {
        let id = MessageId::new();
        let events = vec![
            start(id),
            ChatEvent::ToolCallStart {
                message_id: id,
                tool_call_id: "call_1".to_string(),
                tool_name: "shell".to_string(),
            },
            ChatEvent::ToolCallDelta {
                message_id: id,
                tool_call_id: "call_1".to_string(),
                input_patch: "{\"command\":".to_string(),
            },
            ChatEvent::ToolCallDelta {
                message_id: id,
                tool_call_id: "call_1".to_string(),
                input_patch: "\"ls\"}".to_string(),
            },
            ChatEvent::ToolCallEnd {
                message_id: id,
                tool_call_id: "call_1".to_string(),
                tool_name: "shell".to_string(),
                output: ToolCallOutput::Result {
                    result: serde_json::json!({"exitCode": 0}),
                },
            },
        ];
        let messages = aggregate(Vec::new(), &events);
        let call = messages[0].tool_call("call_1").unwrap();
        assert_eq!(call.input, serde_json::json!({"command": "ls"}));
        assert_eq!(
            call.output,
            Some(ToolCallOutput::Result {
                result: serde_json::json!({"exitCode": 0}),
            })
        );
    }

    #[test]
    fn abort_seals_partial_with_error_metadata_and_tolerates_missing_usage() {
        let id = MessageId::new();
        let events = vec![
            start(id),
            delta(id, "half"),
            ChatEvent::StreamAbort {
                message_id: id,
                metadata: StreamAbortMeta {
                    usage: None,
                    duration_ms: 5,
                    error: Some("interrupted".to_string()),
                    error_type: None,
                },
            },
        ];
        let messages = aggregate(Vec::new(), &events);
        assert!(messages[0].metadata.partial);
        assert_eq!(messages[0].metadata.usage, None);
        assert_eq!(messages[0].metadata.error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn stream_error_marks_the_partial() {
        let id = MessageId::new();
        let events = vec![
            start(id),
            ChatEvent::StreamError {
                message_id: id,
                error: "context window exceeded".to_string(),
                error_type: StreamErrorType::ContextExceeded,
            },
        ];
        let messages = aggregate(Vec::new(), &events);
        assert!(messages[0].metadata.partial);
        assert_eq!(
            messages[0].metadata.error_type,
            Some(StreamErrorType::ContextExceeded)
        );
    }

    #[test]
    fn delete_message_removes_by_id_for_edit_flows() {
        let keep = Message::new(Role::User, vec![MessagePart::text("keep")], 0);
        let drop = Message::new(Role::User, vec![MessagePart::text("drop")], 0);
        let drop_id = drop.id;
        let messages = aggregate(
            vec![keep.clone(), drop],
            &[ChatEvent::DeleteMessage { id: drop_id }],
        );
        assert_eq!(messages, vec![keep]);
    }

    #[test]
    fn whole_message_upserts_instead_of_duplicating() {
        let id = MessageId::new();
        let streamed = aggregate(Vec::new(), &[start(id), delta(id, "partial text")]);

        // Reconnect delivered the finalized form instead of a replay.
        let mut finalized = Message::new(Role::Assistant, vec![MessagePart::text("final")], 9);
        finalized.id = id;
        let messages = aggregate(
            streamed,
            &[ChatEvent::Message {
                message: finalized.clone(),
            }],
        );
        assert_eq!(messages, vec![finalized]);
    }

    #[test]
    fn events_for_unknown_messages_are_ignored() {
        let id = MessageId::new();
        let messages = aggregate(Vec::new(), &[delta(id, "orphan")]);
        assert!(messages.is_empty());
    }
}
