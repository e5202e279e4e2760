use std::path::PathBuf;
use std::time::Duration;

use mux_protocol::MessageId;
use mux_protocol::StreamErrorType;
use mux_protocol::WorkspaceId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MuxErr>;

#[derive(Debug, Error)]
pub enum MuxErr {
    #[error("workspace {0} not found")]
    WorkspaceNotFound(WorkspaceId),

    #[error("message {0} not found in history")]
    MessageNotFound(MessageId),

    #[error("no API key configured for provider `{0}`")]
    ApiKeyNotFound(String),

    #[error("invalid model string `{0}`; expected `provider/model`")]
    InvalidModelString(String),

    #[error("model `{0}` not found")]
    ModelNotFound(String),

    #[error("context window exceeded")]
    ContextExceeded,

    #[error("rate limited{}", .retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Network failures and 5xx responses without known semantics.
    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("provider produced no events for {0:?}")]
    StreamIdleTimeout(Duration),

    #[error("stream interrupted")]
    Interrupted,

    #[error("runtime path `{0}` does not exist")]
    PathNotFound(PathBuf),

    #[error("internal channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MuxErr {
    /// Map onto the closed taxonomy surfaced in `stream-error` events and
    /// persisted on failed partial messages.
    pub fn stream_error_type(&self) -> StreamErrorType {
        match self {
            MuxErr::ApiKeyNotFound(_) => StreamErrorType::ApiKeyNotFound,
            MuxErr::InvalidModelString(_) => StreamErrorType::InvalidModelString,
            MuxErr::ModelNotFound(_) => StreamErrorType::ModelNotFound,
            MuxErr::ContextExceeded => StreamErrorType::ContextExceeded,
            MuxErr::RateLimited { .. } => StreamErrorType::RateLimited,
            MuxErr::ProviderTransient(_) | MuxErr::StreamIdleTimeout(_) => {
                StreamErrorType::ProviderTransient
            }
            _ => StreamErrorType::Unknown,
        }
    }

    /// Transient failures are worth a bounded retry before surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MuxErr::ProviderTransient(_) | MuxErr::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_mapping_is_stable() {
        assert_eq!(
            MuxErr::ContextExceeded.stream_error_type(),
            StreamErrorType::ContextExceeded
        );
        assert_eq!(
            MuxErr::StreamIdleTimeout(Duration::from_secs(60)).stream_error_type(),
            StreamErrorType::ProviderTransient
        );
        assert_eq!(
            MuxErr::Interrupted.stream_error_type(),
            StreamErrorType::Unknown
        );
    }
}
