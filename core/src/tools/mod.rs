//! Tools the model can invoke mid-stream.
//!
//! The registry declares what exists; the per-send [`policy::ToolPolicy`]
//! decides what may actually run. Execution happens inside the streaming
//! task under the stream's cancellation token, so an interrupt tears down
//! tool processes too.

mod fs;
pub mod policy;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::runtime::Runtime;

pub use fs::ReadFileTool;
pub use fs::WriteFileTool;
pub use policy::PolicyAction;
pub use policy::ToolPolicy;
pub use shell::ShellTool;

/// Execution context handed to every tool call. Dropping work promptly when
/// `cancel` fires is each tool's responsibility.
#[derive(Clone)]
pub struct ToolCtx {
    pub runtime: Arc<dyn Runtime>,
    pub cwd: PathBuf,
    pub cancel: CancellationToken,
    /// SIGTERM-to-SIGKILL window for child processes.
    pub interrupt_grace: Duration,
}

/// A tool failure is local to the call: it becomes an `error` payload on the
/// `tool-call-end` event and the stream keeps going so the model can react.
pub type ToolResult = std::result::Result<Value, String>;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn input_schema(&self) -> Value;

    async fn execute(&self, input: Value, ctx: &ToolCtx) -> ToolResult;
}

/// What the provider sees: name, description, schema. Also the unit the
/// cache planner counts.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard workspace toolset.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellTool));
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(WriteFileTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_exposes_specs_in_registration_order() {
        let registry = ToolRegistry::with_builtin_tools();
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["shell", "read_file", "write_file"]);
    }
}
