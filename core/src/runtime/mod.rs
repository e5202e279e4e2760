//! Filesystem and process execution surface a workspace runs against.
//!
//! Every stream and tool invocation receives a `dyn Runtime`, so tests can
//! substitute an in-memory or tempdir-backed variant and remote workspaces
//! can swap in the SSH flavor without the orchestrator noticing.

mod local;
mod ssh;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use local::LocalRuntime;
pub use ssh::SshRuntime;

#[derive(Debug, Clone, Default)]
pub struct SpawnOpts {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A spawned child. `wait` drives it to completion; `kill` tears down the
/// whole process group, SIGTERM first and SIGKILL after the grace window.
#[async_trait]
pub trait ProcessHandle: Send {
    async fn wait(&mut self) -> Result<ProcessOutput>;

    async fn kill(&mut self, grace: Duration) -> Result<()>;
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Normalize a possibly-relative path against the runtime's filesystem.
    async fn resolve_path(&self, path: &Path) -> Result<PathBuf>;

    async fn spawn(
        &self,
        cmd: &str,
        args: &[String],
        opts: SpawnOpts,
    ) -> Result<Box<dyn ProcessHandle>>;
}
