use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tracing::warn;

use super::ProcessHandle;
use super::ProcessOutput;
use super::Runtime;
use super::SpawnOpts;
use crate::error::MuxErr;
use crate::error::Result;

// Conventional shell exit code base for signal deaths: 128 + signal.
const EXIT_CODE_SIGNAL_BASE: i32 = 128;
const SIGKILL_CODE: i32 = 9;

/// Runs against the local machine with tokio processes. Children are placed
/// in their own process group so `kill` can take down the whole tree.
#[derive(Debug, Default, Clone)]
pub struct LocalRuntime;

impl LocalRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(path, contents).await?)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_path(&self, path: &Path) -> Result<PathBuf> {
        match tokio::fs::canonicalize(path).await {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MuxErr::PathNotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn spawn(
        &self,
        cmd: &str,
        args: &[String],
        opts: SpawnOpts,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(cmd);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        if let Some(bytes) = opts.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(&bytes).await?;
            drop(stdin);
        }

        Ok(Box::new(LocalProcess { child }))
    }
}

struct LocalProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    async fn wait(&mut self) -> Result<ProcessOutput> {
        // Drain both pipes concurrently; reading them one after the other can
        // deadlock once the unread pipe's buffer fills.
        let stdout_pipe = self.child.stdout.take();
        let stderr_pipe = self.child.stderr.take();
        let (stdout, stderr) = tokio::join!(drain(stdout_pipe), drain(stderr_pipe));
        let status = self.child.wait().await?;
        let exit_code = exit_code_of(status);
        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn kill(&mut self, grace: Duration) -> Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };

        signal_group(pid, Signal::Term);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(pid, "process ignored SIGTERM, escalating to SIGKILL");
                signal_group(pid, Signal::Kill);
                self.child.start_kill().ok();
                self.child.wait().await?;
            }
        }
        Ok(())
    }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut reader) = pipe {
        reader.read_to_string(&mut buf).await.ok();
    }
    buf
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the process group created at spawn.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_CODE_SIGNAL_BASE + signal;
        }
    }
    EXIT_CODE_SIGNAL_BASE + SIGKILL_CODE
}
