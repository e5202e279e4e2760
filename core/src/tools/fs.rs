use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use super::Tool;
use super::ToolCtx;
use super::ToolResult;

fn resolve_in_workspace(ctx: &ToolCtx, path: &str) -> std::path::PathBuf {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        ctx.cwd.join(p)
    }
}

pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadFileInput {
    path: String,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 file from the workspace and return its contents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, absolute or workspace-relative."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolCtx) -> ToolResult {
        let input: ReadFileInput =
            serde_json::from_value(input).map_err(|e| format!("invalid read_file input: {e}"))?;
        let path = resolve_in_workspace(ctx, &input.path);
        let bytes = ctx
            .runtime
            .read_file(&path)
            .await
            .map_err(|e| format!("read failed: {e}"))?;
        let contents = String::from_utf8_lossy(&bytes).to_string();
        Ok(json!({
            "path": path.display().to_string(),
            "contents": contents,
        }))
    }
}

pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteFileInput {
    path: String,
    contents: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a file in the workspace with the given contents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, absolute or workspace-relative."
                },
                "contents": { "type": "string" }
            },
            "required": ["path", "contents"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolCtx) -> ToolResult {
        let input: WriteFileInput =
            serde_json::from_value(input).map_err(|e| format!("invalid write_file input: {e}"))?;
        let path = resolve_in_workspace(ctx, &input.path);
        ctx.runtime
            .write_file(&path, input.contents.as_bytes())
            .await
            .map_err(|e| format!("write failed: {e}"))?;
        Ok(json!({
            "path": path.display().to_string(),
            "bytesWritten": input.contents.len(),
        }))
    }
}
