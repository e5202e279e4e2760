//! Shared wire types for the mux orchestrator.
//!
//! Everything in this crate is plain data: the message model persisted to the
//! per-workspace history log, the chat-event alphabet delivered to
//! subscribers, and the closed stream-error taxonomy. No I/O, no async.

mod error_type;
mod events;
mod ids;
mod message;

pub use error_type::StreamErrorType;
pub use events::ChatEvent;
pub use events::StreamAbortMeta;
pub use events::StreamEndMeta;
pub use ids::MessageId;
pub use ids::WorkspaceId;
pub use message::Message;
pub use message::MessageMeta;
pub use message::MessagePart;
pub use message::MuxMetadata;
pub use message::Role;
pub use message::ToolCallOutput;
pub use message::ToolCallPart;
pub use message::Usage;
