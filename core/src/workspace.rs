use std::path::PathBuf;

use mux_protocol::WorkspaceId;
use serde::Deserialize;
use serde::Serialize;

/// An isolated agent session. The core never auto-deletes one; creation and
/// removal are explicit user actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    /// The originating project checkout.
    pub project_path: PathBuf,
    /// The isolated working tree commands and tools run in. Often a
    /// worktree of `project_path`; creating it is outside the core's scope.
    pub workspace_path: PathBuf,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl Workspace {
    pub fn new(name: impl Into<String>, project_path: PathBuf, workspace_path: PathBuf) -> Self {
        Self {
            id: WorkspaceId::new(),
            name: name.into(),
            project_path,
            workspace_path,
            created_at: crate::util::now_ms(),
        }
    }
}
