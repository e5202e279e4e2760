//! The seam between the orchestrator and concrete providers.
//!
//! Provider SDKs live outside this crate; the core consumes only the event
//! shapes below. Tests script a [`ModelTransport`] directly, which is also
//! how the end-to-end scenarios drive failure injection.

use std::sync::LazyLock;

use async_trait::async_trait;
use mux_protocol::Message;
use mux_protocol::Usage;
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache_control::CachePlan;
use crate::error::Result;
use crate::tools::ToolSpec;

/// One frame from the provider's response stream.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Delta { text: String },
    ReasoningDelta { text: String },
    /// A complete tool invocation request.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    /// Incremental tool-input JSON, forwarded to subscribers as a patch.
    ToolCallDelta { id: String, input_fragment: String },
    /// The provider itself failed the tool call (e.g. malformed arguments).
    ToolError { id: String, message: String },
    Usage(Usage),
    /// Opaque continuity state, echoed back on the next request.
    ProviderMetadata(Value),
    Finish,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    /// Provider honors cache breakpoints (see `cache_control`).
    pub prompt_cache: bool,
    /// Provider wants the previous response id echoed for reasoning
    /// continuity.
    pub response_continuity: bool,
}

/// A model string the transport has vetted: the provider exists and its API
/// key is present. Whether the model itself exists is only known at stream
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub provider: String,
    pub model: String,
    pub capabilities: ModelCapabilities,
}

impl ResolvedModel {
    pub fn model_string(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// Pass-through options a send may carry for the provider; the test-only
/// flags mirror what streams need for failure injection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderOptions {
    pub disable_auto_truncation: bool,
    pub force_context_limit_error: bool,
    pub simulate_tool_policy_noop: bool,
}

#[derive(Clone)]
pub struct StreamRequest {
    pub system_message: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub cache_plan: CachePlan,
    /// Response id of the previous assistant turn, unless it was recorded
    /// as lost.
    pub previous_response_id: Option<String>,
    pub max_output_tokens: Option<u64>,
    pub thinking_level: Option<String>,
    pub provider_options: ProviderOptions,
}

/// Receiver half of a provider stream. The transport task owns the sender
/// and pushes frames (or one terminal error) as they arrive off the wire.
pub struct ProviderStream {
    pub rx: mpsc::Receiver<Result<ProviderEvent>>,
}

#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Validate the model string format and provider credentials.
    /// Fails with `InvalidModelString` or `ApiKeyNotFound`.
    fn resolve(&self, model_string: &str) -> Result<ResolvedModel>;

    async fn stream(&self, model: &ResolvedModel, request: StreamRequest)
    -> Result<ProviderStream>;
}

/// Split `provider/model`; transports share this so every implementation
/// rejects the same malformed strings.
pub fn split_model_string(model_string: &str) -> Option<(&str, &str)> {
    let (provider, model) = model_string.split_once('/')?;
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}

static LOST_RESPONSE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"Previous response with id '([^']+)' not found")
        .expect("lost-response-id pattern is valid")
});

/// Extract the response id from a provider error complaining that its
/// conversation anchor was evicted. The next send must omit that id so the
/// provider can synthesize a fresh anchor.
pub fn lost_response_id_in(error_text: &str) -> Option<String> {
    LOST_RESPONSE_ID_RE
        .captures(error_text)
        .map(|caps| caps[1].to_string())
}
