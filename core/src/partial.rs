//! Single-slot snapshot of the assistant message currently being streamed.
//!
//! The stream manager coalesces writes here (see `stream.rs`), so a crash
//! mid-stream loses at most a flush interval's worth of deltas. Each write
//! goes through a temp file and rename so the slot is never observed
//! half-written.

use std::path::PathBuf;

use mux_protocol::Message;
use mux_protocol::WorkspaceId;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::history::HistoryStore;

#[derive(Clone)]
pub struct PartialStore {
    path: PathBuf,
}

impl PartialStore {
    pub fn new(config: &Config, workspace_id: WorkspaceId) -> Self {
        Self {
            path: config.partial_path(workspace_id),
        }
    }

    pub async fn write(&self, message: &Message) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(message)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn read(&self) -> Result<Option<Message>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Message>(&bytes) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                // A torn write should never happen given the rename
                // discipline; treat garbage as an empty slot.
                warn!(error = %e, "discarding unparseable partial snapshot");
                Ok(None)
            }
        }
    }

    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read + append + delete. Callers hold the workspace mutex, which is
    /// what makes the composite atomic with respect to other writers.
    pub async fn commit_to_history(&self, history: &HistoryStore) -> Result<Option<u64>> {
        let Some(mut message) = self.read().await? else {
            return Ok(None);
        };
        let seq = history.append(&mut message).await?;
        self.delete().await?;
        Ok(Some(seq))
    }
}
