//! Per-workspace pub/sub for chat events.
//!
//! Subscribers get a replay before anything live: the active stream's
//! accumulated events when one is running, the historical message log
//! otherwise, always terminated by `caught-up`. Replay and registration
//! happen under the same lock as publishing, so a subscriber never misses
//! or double-sees an event around the join point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_channel::Receiver;
use async_channel::Sender;
use mux_protocol::ChatEvent;
use mux_protocol::Message;
use mux_protocol::WorkspaceId;
use tracing::trace;

#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<WorkspaceId, Channel>>,
}

#[derive(Default)]
struct Channel {
    subscribers: Vec<Sender<ChatEvent>>,
    /// Events of the active stream, from `stream-start` up to (and
    /// including) its terminal event; cleared when the stream is over.
    live: Vec<ChatEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, workspace_id: WorkspaceId, event: ChatEvent) {
        let mut channels = lock_channels(&self.channels);
        let channel = channels.entry(workspace_id).or_default();

        let terminal = event.is_terminal();
        match &event {
            ChatEvent::StreamStart { .. } => {
                channel.live = vec![event.clone()];
            }
            _ if !channel.live.is_empty() && event.message_id().is_some() => {
                channel.live.push(event.clone());
            }
            _ => {}
        }

        trace!(%workspace_id, subscribers = channel.subscribers.len(), "publishing event");
        channel
            .subscribers
            .retain(|tx| tx.try_send(event.clone()).is_ok());

        if terminal {
            channel.live.clear();
        }
    }

    /// `history` is the caller's current read of the message log; it is used
    /// only when no stream is active.
    pub fn subscribe(
        &self,
        workspace_id: WorkspaceId,
        history: Vec<Message>,
    ) -> Receiver<ChatEvent> {
        let mut channels = lock_channels(&self.channels);
        let channel = channels.entry(workspace_id).or_default();
        let (tx, rx) = async_channel::unbounded();

        if channel.live.is_empty() {
            for message in history {
                tx.try_send(ChatEvent::Message { message }).ok();
            }
        } else {
            for event in &channel.live {
                tx.try_send(event.clone()).ok();
            }
        }
        tx.try_send(ChatEvent::CaughtUp { workspace_id }).ok();

        channel.subscribers.push(tx);
        rx
    }

    pub fn remove_workspace(&self, workspace_id: WorkspaceId) {
        lock_channels(&self.channels).remove(&workspace_id);
    }
}

fn lock_channels(
    channels: &Mutex<HashMap<WorkspaceId, Channel>>,
) -> std::sync::MutexGuard<'_, HashMap<WorkspaceId, Channel>> {
    match channels.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
