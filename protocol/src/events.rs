use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::StreamErrorType;
use crate::ids::MessageId;
use crate::ids::WorkspaceId;
use crate::message::Message;
use crate::message::ToolCallOutput;
use crate::message::Usage;

/// Everything a chat subscriber can observe, in the order it happened.
///
/// For a given assistant message the sequence is totally ordered:
/// `stream-start` first, then deltas and tool events, then exactly one of
/// `stream-end` / `stream-abort` / `stream-error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    #[serde(rename_all = "camelCase")]
    StreamStart {
        message_id: MessageId,
        history_sequence: u64,
        model: String,
    },
    #[serde(rename_all = "camelCase")]
    StreamDelta {
        message_id: MessageId,
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ReasoningDelta {
        message_id: MessageId,
        delta: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    ReasoningEnd { message_id: MessageId },
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        message_id: MessageId,
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallDelta {
        message_id: MessageId,
        tool_call_id: String,
        /// Raw JSON fragment to splice onto the accumulated input.
        input_patch: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd {
        message_id: MessageId,
        tool_call_id: String,
        tool_name: String,
        #[serde(flatten)]
        output: ToolCallOutput,
    },
    #[serde(rename_all = "camelCase")]
    StreamEnd {
        message_id: MessageId,
        metadata: StreamEndMeta,
    },
    #[serde(rename_all = "camelCase")]
    StreamAbort {
        message_id: MessageId,
        metadata: StreamAbortMeta,
    },
    #[serde(rename_all = "camelCase")]
    StreamError {
        message_id: MessageId,
        error: String,
        error_type: StreamErrorType,
    },
    #[serde(rename_all = "camelCase")]
    DeleteMessage { id: MessageId },
    #[serde(rename_all = "camelCase")]
    CaughtUp { workspace_id: WorkspaceId },
    /// A whole finalized message, delivered out-of-band (historical replay,
    /// user-message echo, compaction summary).
    Message { message: Message },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<Value>,
}

/// Usage may be absent here: a very late abort can lose the race with the
/// provider's final usage frame. Consumers must tolerate both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAbortMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<StreamErrorType>,
}

impl ChatEvent {
    /// The message this event belongs to, when it is message-scoped.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            ChatEvent::StreamStart { message_id, .. }
            | ChatEvent::StreamDelta { message_id, .. }
            | ChatEvent::ReasoningDelta { message_id, .. }
            | ChatEvent::ReasoningEnd { message_id }
            | ChatEvent::ToolCallStart { message_id, .. }
            | ChatEvent::ToolCallDelta { message_id, .. }
            | ChatEvent::ToolCallEnd { message_id, .. }
            | ChatEvent::StreamEnd { message_id, .. }
            | ChatEvent::StreamAbort { message_id, .. }
            | ChatEvent::StreamError { message_id, .. } => Some(*message_id),
            ChatEvent::DeleteMessage { id } => Some(*id),
            ChatEvent::CaughtUp { .. } | ChatEvent::Message { .. } => None,
        }
    }

    /// True for the exactly-one event that terminates a started stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatEvent::StreamEnd { .. }
                | ChatEvent::StreamAbort { .. }
                | ChatEvent::StreamError { .. }
        )
    }
}
