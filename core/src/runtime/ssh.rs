use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use shlex::try_join;

use super::ProcessHandle;
use super::Runtime;
use super::SpawnOpts;
use crate::error::MuxErr;
use crate::error::Result;

/// Same semantics as [`super::LocalRuntime`], executed on a remote host
/// through an `ssh` subprocess per operation. Connection multiplexing and
/// transport tuning live in the user's ssh config, not here.
#[derive(Debug, Clone)]
pub struct SshRuntime {
    host: String,
    local: super::LocalRuntime,
}

impl SshRuntime {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            local: super::LocalRuntime::new(),
        }
    }

    fn remote_command(&self, script: String, stdin: Option<Vec<u8>>) -> (String, Vec<String>, SpawnOpts) {
        let args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.host.clone(),
            "--".to_string(),
            script,
        ];
        (
            "ssh".to_string(),
            args,
            SpawnOpts {
                stdin,
                ..Default::default()
            },
        )
    }

    async fn run_remote(&self, script: String, stdin: Option<Vec<u8>>) -> Result<super::ProcessOutput> {
        let (cmd, args, opts) = self.remote_command(script, stdin);
        let mut handle = self.local.spawn(&cmd, &args, opts).await?;
        handle.wait().await
    }

    fn quote(parts: &[String]) -> Result<String> {
        try_join(parts.iter().map(|s| s.as_str()))
            .map_err(|e| MuxErr::Other(format!("unquotable remote command: {e}")))
    }
}

#[async_trait]
impl Runtime for SshRuntime {
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let script = Self::quote(&["cat".to_string(), path.display().to_string()])?;
        let output = self.run_remote(script, None).await?;
        if output.exit_code != 0 {
            return Err(MuxErr::PathNotFound(path.to_path_buf()));
        }
        Ok(output.stdout.into_bytes())
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        let target = Self::quote(&[path.display().to_string()])?;
        let dir = Self::quote(&[dir])?;
        let script = format!("mkdir -p {dir} && cat > {target}");
        let output = self.run_remote(script, Some(contents.to_vec())).await?;
        if output.exit_code != 0 {
            return Err(MuxErr::Other(format!(
                "remote write failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let target = Self::quote(&[path.display().to_string()])?;
        let output = self.run_remote(format!("test -e {target}"), None).await?;
        Ok(output.exit_code == 0)
    }

    async fn resolve_path(&self, path: &Path) -> Result<PathBuf> {
        let target = Self::quote(&[path.display().to_string()])?;
        let output = self
            .run_remote(format!("readlink -f {target} || realpath {target}"), None)
            .await?;
        if output.exit_code != 0 {
            return Err(MuxErr::PathNotFound(path.to_path_buf()));
        }
        Ok(PathBuf::from(output.stdout.trim()))
    }

    async fn spawn(
        &self,
        cmd: &str,
        args: &[String],
        opts: SpawnOpts,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut parts = Vec::new();
        for (key, value) in &opts.env {
            parts.push(format!("{key}={value}"));
        }
        if !parts.is_empty() {
            parts.insert(0, "env".to_string());
        }
        parts.push(cmd.to_string());
        parts.extend(args.iter().cloned());
        let mut script = Self::quote(&parts)?;
        if let Some(cwd) = &opts.cwd {
            let dir = Self::quote(&[cwd.display().to_string()])?;
            script = format!("cd {dir} && {script}");
        }
        let (ssh_cmd, ssh_args, ssh_opts) = self.remote_command(script, opts.stdin);
        self.local.spawn(&ssh_cmd, &ssh_args, ssh_opts).await
    }
}
