use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::ids::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One ordered segment of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    /// Opaque model-internal thought, streamed separately from the answer so
    /// the consumer can fold it away.
    Reasoning {
        text: String,
    },
    ToolCall(ToolCallPart),
    #[serde(rename_all = "camelCase")]
    File {
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Base64 payload when the attachment is carried inline.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPart {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Structured input, accumulated from streamed JSON fragments.
    pub input: Value,
    /// Present once the call completed; referenced by at most one
    /// result-or-error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ToolCallOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolCallOutput {
    Result { result: Value },
    Error { error: String },
}

/// Token accounting for a single model response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl Usage {
    pub fn add(&self, other: &Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
            cached_input_tokens: self
                .cached_input_tokens
                .saturating_add(other.cached_input_tokens),
            cache_creation_tokens: self
                .cache_creation_tokens
                .saturating_add(other.cache_creation_tokens),
            reasoning_tokens: self.reasoning_tokens.saturating_add(other.reasoning_tokens),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.reasoning_tokens)
    }
}

/// Out-of-band metadata a user message may carry. Currently only the
/// compaction request record produced by `/compact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MuxMetadata {
    #[serde(rename_all = "camelCase")]
    CompactionRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        target_words: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        continue_message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_model: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Provider-opaque continuity state, e.g. a previous-response id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compacted: bool,
    /// Summed usage of every message discarded by a compaction, preserved on
    /// the surviving summary message so cost accounting survives the rewrite.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub historical_usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<crate::StreamErrorType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Assigned by the history store at append time; `None` until then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_sequence: Option<u64>,
    pub metadata: MessageMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mux_metadata: Option<MuxMetadata>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<MessagePart>, timestamp: i64) -> Self {
        Self {
            id: MessageId::new(),
            role,
            parts,
            history_sequence: None,
            metadata: MessageMeta {
                timestamp,
                ..Default::default()
            },
            mux_metadata: None,
        }
    }

    /// Concatenated plain-text content, ignoring reasoning and tool parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_call(&self, tool_call_id: &str) -> Option<&ToolCallPart> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::ToolCall(call) if call.tool_call_id == tool_call_id => Some(call),
            _ => None,
        })
    }
}
