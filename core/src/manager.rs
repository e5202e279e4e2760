//! The RPC-shaped surface the UI process talks to.
//!
//! A thin façade over [`StreamManager`]: it owns workspace registration and
//! maps orchestrator results onto the success/failure envelopes the IPC
//! layer serializes. All real behavior lives one level down.

use std::path::PathBuf;
use std::sync::Arc;

use async_channel::Receiver;
use mux_protocol::ChatEvent;
use mux_protocol::Message;
use mux_protocol::MessageId;
use mux_protocol::WorkspaceId;

use crate::config::Config;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::stream::SendError;
use crate::stream::SendOptions;
use crate::stream::StreamManager;
use crate::tools::ToolRegistry;
use crate::transport::ModelTransport;
use crate::workspace::Workspace;

/// Outcome envelope for `workspace.sendMessage`.
#[derive(Debug)]
pub enum SendResponse {
    Success { message_id: MessageId },
    Failure { error: SendError },
}

impl SendResponse {
    pub fn success(&self) -> bool {
        matches!(self, SendResponse::Success { .. })
    }

    pub fn error(&self) -> Option<&SendError> {
        match self {
            SendResponse::Success { .. } => None,
            SendResponse::Failure { error } => Some(error),
        }
    }
}

pub struct WorkspaceManager {
    streams: Arc<StreamManager>,
}

impl WorkspaceManager {
    pub fn new(
        config: Config,
        transport: Arc<dyn ModelTransport>,
        registry: ToolRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: StreamManager::new(config, transport, registry),
        })
    }

    /// The orchestrator behind this façade, for callers that need the full
    /// surface.
    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn create_workspace(
        &self,
        name: impl Into<String>,
        project_path: PathBuf,
        workspace_path: PathBuf,
        runtime: Arc<dyn Runtime>,
    ) -> WorkspaceId {
        let workspace = Workspace::new(name, project_path, workspace_path);
        self.streams.add_workspace(workspace, runtime)
    }

    pub async fn remove_workspace(&self, workspace_id: WorkspaceId) -> Result<()> {
        self.streams.remove_workspace(workspace_id).await
    }

    pub fn workspace(&self, workspace_id: WorkspaceId) -> Result<Workspace> {
        self.streams.workspace(workspace_id)
    }

    pub async fn send_message(
        &self,
        workspace_id: WorkspaceId,
        text: &str,
        options: SendOptions,
    ) -> SendResponse {
        match self.streams.submit(workspace_id, text, options).await {
            Ok(message_id) => SendResponse::Success { message_id },
            Err(error) => SendResponse::Failure { error },
        }
    }

    /// Bounded-time interrupt of the workspace's active stream, if any.
    pub async fn interrupt_stream(&self, workspace_id: WorkspaceId) -> Result<()> {
        self.streams.interrupt_stream(workspace_id).await
    }

    pub async fn replace_chat_history(
        &self,
        workspace_id: WorkspaceId,
        message: Message,
    ) -> Result<()> {
        self.streams.replace_chat_history(workspace_id, message).await
    }

    pub async fn subscribe_chat(&self, workspace_id: WorkspaceId) -> Result<Receiver<ChatEvent>> {
        self.streams.subscribe(workspace_id).await
    }

    pub async fn cancel_compaction(
        &self,
        workspace_id: WorkspaceId,
        request_id: MessageId,
    ) -> Result<()> {
        self.streams.cancel_compaction(workspace_id, request_id).await
    }

    pub async fn read_history(&self, workspace_id: WorkspaceId) -> Result<Vec<Message>> {
        self.streams.read_history(workspace_id).await
    }

    pub async fn read_partial(&self, workspace_id: WorkspaceId) -> Result<Option<Message>> {
        self.streams.read_partial(workspace_id).await
    }
}
