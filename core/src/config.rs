use std::path::PathBuf;
use std::time::Duration;

use mux_protocol::WorkspaceId;

pub const WORKSPACES_SUBDIR: &str = "workspaces";
pub const HISTORY_FILENAME: &str = "history.jsonl";
pub const PARTIAL_FILENAME: &str = "partial.json";
pub const COMPACT_CANCELLED_FILENAME: &str = "compact-cancelled";

/// Orchestrator-wide settings. One `Config` is shared by every workspace;
/// per-send knobs travel in `SendOptions` instead.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all persisted state, `~/.mux` by default. Also the location
    /// of the global instruction files.
    pub mux_home: PathBuf,

    /// Default model string, `provider/model` format.
    pub model: String,

    /// Mode name used when a send does not specify one.
    pub default_mode: String,

    /// Floor between two partial-snapshot flushes for the same stream.
    pub partial_flush_interval: Duration,

    /// Provider silence beyond this maps to `provider_transient`.
    pub stream_idle_timeout: Duration,

    /// Window between SIGTERM and SIGKILL when tearing down tool processes.
    pub interrupt_grace: Duration,

    /// Upper bound applied to `max_output_tokens` for compaction streams.
    pub compact_output_token_cap: u64,
}

impl Config {
    pub fn new(mux_home: PathBuf) -> Self {
        Self {
            mux_home,
            model: "openai/gpt-5".to_string(),
            default_mode: "exec".to_string(),
            partial_flush_interval: Duration::from_millis(250),
            stream_idle_timeout: Duration::from_secs(60),
            interrupt_grace: Duration::from_millis(500),
            compact_output_token_cap: 8192,
        }
    }

    /// `~/.mux`, when a home directory can be resolved at all.
    pub fn default_home() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".mux"))
    }

    pub fn workspace_dir(&self, id: WorkspaceId) -> PathBuf {
        self.mux_home.join(WORKSPACES_SUBDIR).join(id.to_string())
    }

    pub fn history_path(&self, id: WorkspaceId) -> PathBuf {
        self.workspace_dir(id).join(HISTORY_FILENAME)
    }

    pub fn partial_path(&self, id: WorkspaceId) -> PathBuf {
        self.workspace_dir(id).join(PARTIAL_FILENAME)
    }

    /// Ephemeral marker consulted by the compaction controller when a
    /// compaction stream aborts: present means the user truly cancelled.
    pub fn compact_cancel_marker_path(&self, id: WorkspaceId) -> PathBuf {
        self.workspace_dir(id).join(COMPACT_CANCELLED_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_paths_nest_under_mux_home() {
        let config = Config::new(PathBuf::from("/tmp/mux-home"));
        let id = WorkspaceId::new();
        let history = config.history_path(id);
        assert!(history.starts_with("/tmp/mux-home/workspaces"));
        assert!(history.ends_with(HISTORY_FILENAME));
    }
}
