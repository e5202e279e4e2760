use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use super::Tool;
use super::ToolCtx;
use super::ToolResult;
use crate::runtime::SpawnOpts;

/// Runs a shell command inside the workspace via the Runtime. On stream
/// interruption the whole process group is torn down before the call
/// returns.
pub struct ShellTool;

#[derive(Deserialize)]
struct ShellInput {
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the workspace working directory and return \
         its exit code, stdout and stderr."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line, run with `bash -lc`."
                },
                "timeout_ms": {
                    "type": "number",
                    "description": "Optional wall-clock limit in milliseconds."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolCtx) -> ToolResult {
        let input: ShellInput =
            serde_json::from_value(input).map_err(|e| format!("invalid shell input: {e}"))?;
        debug!(command = %input.command, "running shell tool");

        let mut handle = ctx
            .runtime
            .spawn(
                "bash",
                &["-lc".to_string(), input.command.clone()],
                SpawnOpts {
                    cwd: Some(ctx.cwd.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| format!("failed to spawn command: {e}"))?;

        // Both arms resolve to a value so the wait future is dropped before
        // we touch the handle again; `None` covers timeout and cancellation,
        // disambiguated below.
        let waited = match input.timeout_ms {
            Some(ms) => {
                let limit = std::time::Duration::from_millis(ms);
                tokio::select! {
                    res = tokio::time::timeout(limit, handle.wait()) => res.ok(),
                    _ = ctx.cancel.cancelled() => None,
                }
            }
            None => {
                tokio::select! {
                    res = handle.wait() => Some(res),
                    _ = ctx.cancel.cancelled() => None,
                }
            }
        };

        match waited {
            Some(Ok(output)) => Ok(json!({
                "exitCode": output.exit_code,
                "stdout": output.stdout,
                "stderr": output.stderr,
            })),
            Some(Err(e)) => Err(format!("command failed: {e}")),
            // Timeout or cancellation: tear the process group down first.
            None => {
                if ctx.cancel.is_cancelled() {
                    cancel_kill(&mut *handle, ctx).await
                } else {
                    handle
                        .kill(ctx.interrupt_grace)
                        .await
                        .map_err(|e| format!("failed to kill timed-out command: {e}"))?;
                    Err("command timed out".to_string())
                }
            }
        }
    }
}

async fn cancel_kill(handle: &mut dyn crate::runtime::ProcessHandle, ctx: &ToolCtx) -> ToolResult {
    handle
        .kill(ctx.interrupt_grace)
        .await
        .map_err(|e| format!("failed to kill interrupted command: {e}"))?;
    Err("interrupted".to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::runtime::LocalRuntime;
    use tokio_util::sync::CancellationToken;

    fn ctx(cancel: CancellationToken) -> ToolCtx {
        ToolCtx {
            runtime: Arc::new(LocalRuntime::new()),
            cwd: std::env::temp_dir(),
            cancel,
            interrupt_grace: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn echoes_output_and_exit_code() {
        let result = ShellTool
            .execute(
                json!({"command": "printf out; printf err >&2; exit 2"}),
                &ctx(CancellationToken::new()),
            )
            .await
            .unwrap();
        assert_eq!(result["exitCode"], 2);
        assert_eq!(result["stdout"], "out");
        assert_eq!(result["stderr"], "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_a_sleeping_command_quickly() {
        let cancel = CancellationToken::new();
        let tool_ctx = ctx(cancel.clone());
        let started = Instant::now();
        let task = tokio::spawn(async move {
            ShellTool
                .execute(json!({"command": "sleep 60"}), &tool_ctx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err(), "interrupted");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn timeout_is_reported_as_error() {
        let result = ShellTool
            .execute(
                json!({"command": "sleep 5", "timeout_ms": 100}),
                &ctx(CancellationToken::new()),
            )
            .await;
        assert_eq!(result.unwrap_err(), "command timed out");
    }
}
