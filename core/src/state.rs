//! Per-workspace streaming state and the running-stream record.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use mux_protocol::MessageId;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

/// Lifecycle of a workspace's stream slot. `Aborting` and `Errored` are
/// side-exits; both drain back to `Idle` through `Finalizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Starting,
    Streaming,
    Finalizing,
    Aborting,
    Errored,
}

/// Handle to the one stream a workspace may have in flight.
#[derive(Clone)]
pub(crate) struct RunningStream {
    pub message_id: MessageId,
    #[allow(dead_code)]
    pub stream_token: Uuid,
    /// Cancelling this is the only way anything stops the stream; the
    /// driver, tool processes and provider read loop all hang off it.
    pub cancel: CancellationToken,
    /// Fired (cancelled) by the driver after finalization is fully done,
    /// events published and the partial committed.
    pub done: CancellationToken,
    /// Set by whoever performs finalization first; the loser must not
    /// commit again.
    pub finalized: Arc<AtomicBool>,
    pub phase: Arc<Mutex<StreamPhase>>,
    pub handle: Arc<AbortOnDropHandle<()>>,
    pub started: Instant,
    /// Present when this stream is a compaction summarization; holds the
    /// originating request message id.
    pub compaction_request: Option<MessageId>,
}

impl RunningStream {
    pub fn set_phase(&self, phase: StreamPhase) {
        if let Ok(mut guard) = self.phase.lock() {
            *guard = phase;
        }
    }
}

/// All mutable per-workspace orchestration state. The `start_lock` is the
/// workspace mutex from the design: it serializes sends (and the
/// abort-previous / truncate / append prefix of each send); it does not
/// cover tool execution, which is interrupted via `cancel` instead.
#[derive(Default)]
pub(crate) struct WorkspaceState {
    pub start_lock: tokio::sync::Mutex<()>,
    pub running: Mutex<Option<RunningStream>>,
    /// Provider response ids the provider told us it no longer has. The
    /// next request omits them so the provider can re-anchor.
    pub lost_response_ids: Mutex<HashSet<String>>,
    /// Compaction request ids already applied; duplicated terminal events
    /// must not double-apply a history rewrite.
    pub applied_compactions: Mutex<HashSet<MessageId>>,
}

impl WorkspaceState {
    pub fn current_stream(&self) -> Option<RunningStream> {
        self.running.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn set_stream(&self, stream: RunningStream) {
        if let Ok(mut guard) = self.running.lock() {
            *guard = Some(stream);
        }
    }

    /// Clears the slot if it still holds `message_id`; a newer stream's
    /// registration must not be clobbered by an old driver finishing late.
    pub fn clear_stream(&self, message_id: MessageId) {
        if let Ok(mut guard) = self.running.lock()
            && guard.as_ref().is_some_and(|s| s.message_id == message_id)
        {
            *guard = None;
        }
    }

    pub fn record_lost_response_id(&self, id: String) {
        if let Ok(mut guard) = self.lost_response_ids.lock() {
            guard.insert(id);
        }
    }

    /// True (and forgets the id) when `id` was previously recorded lost.
    pub fn take_lost_response_id(&self, id: &str) -> bool {
        self.lost_response_ids
            .lock()
            .map(|mut guard| guard.remove(id))
            .unwrap_or(false)
    }

    /// Returns false when this request id was already compacted.
    pub fn mark_compaction_applied(&self, request_id: MessageId) -> bool {
        self.applied_compactions
            .lock()
            .map(|mut guard| guard.insert(request_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_response_ids_are_taken_once() {
        let state = WorkspaceState::default();
        state.record_lost_response_id("resp_abc".to_string());
        assert!(state.take_lost_response_id("resp_abc"));
        assert!(!state.take_lost_response_id("resp_abc"));
        assert!(!state.take_lost_response_id("resp_other"));
    }

    #[test]
    fn compaction_dedupe_rejects_the_second_application() {
        let state = WorkspaceState::default();
        let id = MessageId::new();
        assert!(state.mark_compaction_applied(id));
        assert!(!state.mark_compaction_applied(id));
    }
}
