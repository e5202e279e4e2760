use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// Closed taxonomy for stream failures, used both in events and in the
/// metadata persisted on a failed partial message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorType {
    ApiKeyNotFound,
    InvalidModelString,
    ModelNotFound,
    ContextExceeded,
    RateLimited,
    ProviderTransient,
    Unknown,
}

impl StreamErrorType {
    /// Configuration errors fail the send synchronously; nothing is
    /// streamed.
    pub fn is_configuration(self) -> bool {
        matches!(
            self,
            StreamErrorType::ApiKeyNotFound
                | StreamErrorType::InvalidModelString
                | StreamErrorType::ModelNotFound
        )
    }
}

impl Display for StreamErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamErrorType::ApiKeyNotFound => "api_key_not_found",
            StreamErrorType::InvalidModelString => "invalid_model_string",
            StreamErrorType::ModelNotFound => "model_not_found",
            StreamErrorType::ContextExceeded => "context_exceeded",
            StreamErrorType::RateLimited => "rate_limited",
            StreamErrorType::ProviderTransient => "provider_transient",
            StreamErrorType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
