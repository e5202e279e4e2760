//! Append-only, per-workspace event log of finalized messages.
//!
//! Stored as `workspaces/<id>/history.jsonl`, one JSON object per line.
//! Appends are a single `write(2)` on a file opened with `O_APPEND` under an
//! advisory lock, so a crash can lose at most the line being written, never
//! corrupt earlier ones. `truncate_after` and `replace_all` rewrite through a
//! temp file and rename, which is atomic on POSIX filesystems.

use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use mux_protocol::Message;
use mux_protocol::MessageId;
use mux_protocol::WorkspaceId;
use tracing::warn;

use crate::config::Config;
use crate::error::MuxErr;
use crate::error::Result;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const MAX_LOCK_RETRIES: usize = 10;
const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    /// Next sequence to hand out. Lazily initialized from the log; kept
    /// monotonic across truncation and replacement so sequences never
    /// repeat within a workspace.
    next_seq: Mutex<Option<u64>>,
}

impl HistoryStore {
    pub fn new(config: &Config, workspace_id: WorkspaceId) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: config.history_path(workspace_id),
                next_seq: Mutex::new(None),
            }),
        }
    }

    /// Atomic append. Assigns and returns the message's `history_sequence`.
    pub async fn append(&self, message: &mut Message) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        let mut to_write = message.clone();
        let seq = tokio::task::spawn_blocking(move || inner.append_blocking(&mut to_write))
            .await
            .map_err(|_| MuxErr::ChannelClosed)??;
        message.history_sequence = Some(seq);
        Ok(seq)
    }

    /// All messages, ordered by sequence ascending.
    pub async fn read(&self) -> Result<Vec<Message>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.read_blocking())
            .await
            .map_err(|_| MuxErr::ChannelClosed)?
    }

    /// Removes `message_id` and every later message, atomically. Fails with
    /// [`MuxErr::MessageNotFound`] when the id is not in the log.
    pub async fn truncate_after(&self, message_id: MessageId) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.truncate_after_blocking(message_id))
            .await
            .map_err(|_| MuxErr::ChannelClosed)?
    }

    /// Replaces the whole log with a single message (compaction). The
    /// message still receives the next sequence, keeping the per-workspace
    /// counter strictly increasing across the rewrite.
    pub async fn replace_all(&self, message: &mut Message) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        let mut to_write = message.clone();
        let seq = tokio::task::spawn_blocking(move || inner.replace_all_blocking(&mut to_write))
            .await
            .map_err(|_| MuxErr::ChannelClosed)??;
        message.history_sequence = Some(seq);
        Ok(seq)
    }
}

impl Inner {
    fn append_blocking(&self, message: &mut Message) -> Result<u64> {
        std::fs::create_dir_all(parent_of(&self.path))?;

        let mut next_seq = self
            .next_seq
            .lock()
            .map_err(|_| MuxErr::Other("history sequence lock poisoned".to_string()))?;
        let seq = match *next_seq {
            Some(seq) => seq,
            None => self.scan_next_seq()?,
        };
        message.history_sequence = Some(seq);

        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let mut options = OpenOptions::new();
        options.append(true).read(true).create(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.path)?;
        acquire_exclusive_lock_with_retry(&file)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        *next_seq = Some(seq + 1);
        Ok(seq)
    }

    fn read_blocking(&self) -> Result<Vec<Message>> {
        let file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        acquire_shared_lock_with_retry(&file)?;

        let reader = BufReader::new(&file);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(error = %e, "skipping unparseable history line");
                }
            }
        }
        Ok(messages)
    }

    fn truncate_after_blocking(&self, message_id: MessageId) -> Result<()> {
        let messages = self.read_blocking()?;
        let Some(index) = messages.iter().position(|m| m.id == message_id) else {
            return Err(MuxErr::MessageNotFound(message_id));
        };
        self.rewrite_blocking(&messages[..index])
    }

    fn replace_all_blocking(&self, message: &mut Message) -> Result<u64> {
        let mut next_seq = self
            .next_seq
            .lock()
            .map_err(|_| MuxErr::Other("history sequence lock poisoned".to_string()))?;
        let seq = match *next_seq {
            Some(seq) => seq,
            None => self.scan_next_seq()?,
        };
        message.history_sequence = Some(seq);
        self.rewrite_blocking(std::slice::from_ref(message))?;
        *next_seq = Some(seq + 1);
        Ok(seq)
    }

    /// Write the given messages to a temp file and rename it over the log.
    fn rewrite_blocking(&self, messages: &[Message]) -> Result<()> {
        let dir = parent_of(&self.path);
        std::fs::create_dir_all(&dir)?;
        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);
            let mut tmp = options.open(&tmp_path)?;
            for message in messages {
                let mut line = serde_json::to_string(message)?;
                line.push('\n');
                tmp.write_all(line.as_bytes())?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn scan_next_seq(&self) -> Result<u64> {
        let messages = self.read_blocking()?;
        Ok(messages
            .iter()
            .filter_map(|m| m.history_sequence)
            .max()
            .map(|max| max + 1)
            .unwrap_or(1))
    }
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn acquire_exclusive_lock_with_retry(file: &std::fs::File) -> Result<()> {
    for _ in 0..MAX_LOCK_RETRIES {
        match fs2::FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(LOCK_RETRY_SLEEP);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(MuxErr::Other(
        "could not acquire exclusive lock on history file".to_string(),
    ))
}

fn acquire_shared_lock_with_retry(file: &std::fs::File) -> Result<()> {
    for _ in 0..MAX_LOCK_RETRIES {
        match fs2::FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(LOCK_RETRY_SLEEP);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(MuxErr::Other(
        "could not acquire shared lock on history file".to_string(),
    ))
}
