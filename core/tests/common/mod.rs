//! Shared harness for the end-to-end stream scenarios: a mux home in a
//! tempdir, a local runtime, and a scripted transport that stands in for
//! the provider.

#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_channel::Receiver;
use async_trait::async_trait;
use mux_core::Config;
use mux_core::MuxErr;
use mux_core::WorkspaceManager;
use mux_core::runtime::LocalRuntime;
use mux_core::tools::ToolRegistry;
use mux_core::transport::ModelCapabilities;
use mux_core::transport::ModelTransport;
use mux_core::transport::ProviderEvent;
use mux_core::transport::ProviderStream;
use mux_core::transport::ResolvedModel;
use mux_core::transport::StreamRequest;
use mux_core::transport::split_model_string;
use mux_protocol::ChatEvent;
use mux_protocol::Usage;
use mux_protocol::WorkspaceId;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const TEST_MODEL: &str = "openai/gpt-5";

/// One scripted step of a provider stream.
#[derive(Clone)]
pub enum Step {
    Event(ProviderEvent),
    WaitMs(u64),
}

#[derive(Clone)]
pub enum FailKind {
    ContextExceeded,
    ModelNotFound(String),
    Unknown(String),
}

impl FailKind {
    fn to_err(&self) -> MuxErr {
        match self {
            FailKind::ContextExceeded => MuxErr::ContextExceeded,
            FailKind::ModelNotFound(model) => MuxErr::ModelNotFound(model.clone()),
            FailKind::Unknown(text) => MuxErr::Other(text.clone()),
        }
    }
}

/// What the transport does for one `stream` call.
#[derive(Clone)]
pub enum Script {
    /// Feed these steps, then close the stream.
    Events(Vec<Step>),
    /// Feed these steps, then leave the stream open until the driver goes
    /// away (used to park a stream so it can be interrupted or replaced).
    Hang(Vec<Step>),
    /// Fail the stream call itself.
    Fail(FailKind),
    /// Feed these steps, then fail mid-stream.
    FailAfter(Vec<Step>, FailKind),
}

pub fn ok_script(text: &str) -> Script {
    Script::Events(vec![
        Step::Event(ProviderEvent::Delta {
            text: text.to_string(),
        }),
        Step::Event(ProviderEvent::Usage(Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        })),
        Step::Event(ProviderEvent::Finish),
    ])
}

#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
    missing_key_providers: Mutex<HashSet<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn mark_key_missing(&self, provider: &str) {
        self.missing_key_providers
            .lock()
            .unwrap()
            .insert(provider.to_string());
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> StreamRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn resolve(&self, model_string: &str) -> mux_core::Result<ResolvedModel> {
        let (provider, model) = split_model_string(model_string)
            .ok_or_else(|| MuxErr::InvalidModelString(model_string.to_string()))?;
        if self.missing_key_providers.lock().unwrap().contains(provider) {
            return Err(MuxErr::ApiKeyNotFound(provider.to_string()));
        }
        Ok(ResolvedModel {
            provider: provider.to_string(),
            model: model.to_string(),
            capabilities: ModelCapabilities {
                prompt_cache: true,
                response_continuity: true,
            },
        })
    }

    async fn stream(
        &self,
        _model: &ResolvedModel,
        request: StreamRequest,
    ) -> mux_core::Result<ProviderStream> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok_script("ok"));

        let (steps, hang, fail) = match script {
            Script::Events(steps) => (steps, false, None),
            Script::Hang(steps) => (steps, true, None),
            Script::Fail(kind) => return Err(kind.to_err()),
            Script::FailAfter(steps, kind) => (steps, false, Some(kind)),
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Event(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Step::WaitMs(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                }
            }
            if let Some(kind) = fail {
                tx.send(Err(kind.to_err())).await.ok();
                return;
            }
            if hang {
                // Keep the sender alive so the channel never closes; the
                // driver leaves via cancellation.
                tx.closed().await;
            }
        });
        Ok(ProviderStream { rx })
    }
}

pub struct TestMux {
    pub home: TempDir,
    pub workdir: TempDir,
    pub manager: Arc<WorkspaceManager>,
    pub transport: Arc<ScriptedTransport>,
    pub workspace_id: WorkspaceId,
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

impl TestMux {
    pub fn new() -> Self {
        init_tracing();
        let home = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        let mut config = Config::new(home.path().to_path_buf());
        config.model = TEST_MODEL.to_string();
        config.partial_flush_interval = Duration::from_millis(25);
        config.stream_idle_timeout = Duration::from_secs(3);
        config.interrupt_grace = Duration::from_millis(200);

        let transport = ScriptedTransport::new();
        let manager = WorkspaceManager::new(
            config,
            transport.clone(),
            ToolRegistry::with_builtin_tools(),
        );
        let workspace_id = manager.create_workspace(
            "test",
            workdir.path().to_path_buf(),
            workdir.path().to_path_buf(),
            Arc::new(LocalRuntime::new()),
        );
        Self {
            home,
            workdir,
            manager,
            transport,
            workspace_id,
        }
    }

    pub async fn subscribe(&self) -> Receiver<ChatEvent> {
        self.manager.subscribe_chat(self.workspace_id).await.unwrap()
    }
}

/// Receive events until one matches, with a hard deadline. Panics on
/// timeout so a hung stream fails the test instead of wedging it.
pub async fn wait_for(
    rx: &Receiver<ChatEvent>,
    deadline: Duration,
    mut matches: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(deadline, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
            seen.push(summary_of(&event));
        }
    })
    .await;
    match result {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for event; saw {seen:?}"),
    }
}

pub async fn wait_terminal(rx: &Receiver<ChatEvent>, deadline: Duration) -> ChatEvent {
    wait_for(rx, deadline, ChatEvent::is_terminal).await
}

fn summary_of(event: &ChatEvent) -> String {
    match event {
        ChatEvent::Message { message } => format!("message({:?})", message.role),
        other => serde_json::to_value(other)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string()),
    }
}
