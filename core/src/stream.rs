//! The workspace stream orchestrator.
//!
//! One stream per workspace, serialized by a per-workspace mutex. A send
//! acquires the mutex, aborts any previous stream, performs the
//! edit-truncation and user-message append, then hands a fully prepared
//! request to a driver task that demultiplexes provider events into public
//! chat events while snapshotting the in-flight assistant message.
//!
//! Finalization is guarded by a per-stream flag: exactly one of the driver,
//! the interrupt path or the replace path commits the partial and publishes
//! the terminal event.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use mux_protocol::ChatEvent;
use mux_protocol::Message;
use mux_protocol::MessageId;
use mux_protocol::MessageMeta;
use mux_protocol::MessagePart;
use mux_protocol::MuxMetadata;
use mux_protocol::Role;
use mux_protocol::StreamAbortMeta;
use mux_protocol::StreamEndMeta;
use mux_protocol::ToolCallOutput;
use mux_protocol::ToolCallPart;
use mux_protocol::Usage;
use mux_protocol::WorkspaceId;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::cache_control::plan_cache_breakpoints;
use crate::compact;
use crate::compact::CompactionCtx;
use crate::config::Config;
use crate::error::MuxErr;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::history::HistoryStore;
use crate::partial::PartialStore;
use crate::runtime::Runtime;
use crate::state::RunningStream;
use crate::state::StreamPhase;
use crate::state::WorkspaceState;
use crate::system_message::SystemMessageInputs;
use crate::system_message::build_system_message;
use crate::tools::ToolCtx;
use crate::tools::ToolPolicy;
use crate::tools::ToolRegistry;
use crate::transport::ModelTransport;
use crate::transport::ProviderEvent;
use crate::transport::ProviderOptions;
use crate::transport::ResolvedModel;
use crate::transport::StreamRequest;
use crate::transport::lost_response_id_in;
use crate::util::backoff;
use crate::util::now_ms;
use crate::workspace::Workspace;

/// Transport-call retries before a transient failure is surfaced.
const MAX_STREAM_RETRIES: u64 = 2;

/// How long an interrupt waits for the driver to finalize on its own
/// before force-aborting it; well inside the 2 s contract.
const INTERRUPT_DEADLINE: Duration = Duration::from_millis(1500);

/// How long ensure-stream-safety waits for the previous stream's
/// finalization before force-aborting it.
const REPLACE_DEADLINE: Duration = Duration::from_secs(5);

/// An inline attachment carried on a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Default, Clone)]
pub struct SendOptions {
    /// `provider/model`; the configured default applies when absent.
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub tool_policy: ToolPolicy,
    pub additional_system_instructions: Option<String>,
    pub mode: Option<String>,
    pub max_output_tokens: Option<u64>,
    /// Truncate history at this message (inclusive) before sending.
    pub edit_message_id: Option<MessageId>,
    pub image_parts: Vec<ImageAttachment>,
    pub mux_metadata: Option<MuxMetadata>,
    pub provider_options: ProviderOptions,
    /// Fires to abort this send; equivalent to `interrupt_stream` scoped to
    /// the one stream.
    pub abort_signal: Option<CancellationToken>,
}

/// Synchronous send failures; everything else arrives as a `stream-error`
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorType {
    ApiKeyNotFound,
    InvalidModelString,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct SendError {
    pub error_type: SendErrorType,
    pub message: String,
}

impl SendError {
    fn unknown(message: impl Into<String>) -> Self {
        Self {
            error_type: SendErrorType::Unknown,
            message: message.into(),
        }
    }
}

impl From<MuxErr> for SendError {
    fn from(err: MuxErr) -> Self {
        let error_type = match &err {
            MuxErr::ApiKeyNotFound(_) => SendErrorType::ApiKeyNotFound,
            MuxErr::InvalidModelString(_) => SendErrorType::InvalidModelString,
            _ => SendErrorType::Unknown,
        };
        Self {
            error_type,
            message: err.to_string(),
        }
    }
}

/// Everything the orchestrator owns for one workspace.
pub struct WorkspaceEntry {
    pub workspace: Workspace,
    pub runtime: Arc<dyn Runtime>,
    pub history: HistoryStore,
    pub partial: PartialStore,
    pub(crate) state: WorkspaceState,
}

pub struct StreamManager {
    config: Arc<Config>,
    transport: Arc<dyn ModelTransport>,
    registry: Arc<ToolRegistry>,
    bus: EventBus,
    entries: Mutex<HashMap<WorkspaceId, Arc<WorkspaceEntry>>>,
}

impl StreamManager {
    pub fn new(
        config: Config,
        transport: Arc<dyn ModelTransport>,
        registry: ToolRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            transport,
            registry: Arc::new(registry),
            bus: EventBus::new(),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn add_workspace(&self, workspace: Workspace, runtime: Arc<dyn Runtime>) -> WorkspaceId {
        let id = workspace.id;
        let entry = Arc::new(WorkspaceEntry {
            history: HistoryStore::new(&self.config, id),
            partial: PartialStore::new(&self.config, id),
            state: WorkspaceState::default(),
            runtime,
            workspace,
        });
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, entry);
        }
        info!(workspace_id = %id, "workspace registered");
        id
    }

    pub async fn remove_workspace(&self, workspace_id: WorkspaceId) -> Result<()> {
        self.interrupt_stream(workspace_id).await.ok();
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&workspace_id);
        }
        self.bus.remove_workspace(workspace_id);
        Ok(())
    }

    pub(crate) fn entry(&self, workspace_id: WorkspaceId) -> Result<Arc<WorkspaceEntry>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&workspace_id).cloned())
            .ok_or(MuxErr::WorkspaceNotFound(workspace_id))
    }

    pub fn workspace(&self, workspace_id: WorkspaceId) -> Result<Workspace> {
        Ok(self.entry(workspace_id)?.workspace.clone())
    }

    pub(crate) fn publish(&self, workspace_id: WorkspaceId, event: ChatEvent) {
        self.bus.publish(workspace_id, event);
    }

    pub async fn read_history(&self, workspace_id: WorkspaceId) -> Result<Vec<Message>> {
        self.entry(workspace_id)?.history.read().await
    }

    pub async fn read_partial(&self, workspace_id: WorkspaceId) -> Result<Option<Message>> {
        self.entry(workspace_id)?.partial.read().await
    }

    /// Replay (active stream or history) followed by `caught-up`, then live
    /// events, ordered and lossless.
    pub async fn subscribe(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<async_channel::Receiver<ChatEvent>> {
        let entry = self.entry(workspace_id)?;
        let history = entry.history.read().await?;
        Ok(self.bus.subscribe(workspace_id, history))
    }

    /// Atomically replace the whole chat history with one message.
    pub async fn replace_chat_history(
        &self,
        workspace_id: WorkspaceId,
        mut message: Message,
    ) -> Result<()> {
        let entry = self.entry(workspace_id)?;
        let _guard = entry.state.start_lock.lock().await;
        self.ensure_stream_safety(&entry).await;
        entry.history.replace_all(&mut message).await?;
        self.publish(workspace_id, ChatEvent::Message { message });
        Ok(())
    }

    /// Record that the user truly cancelled a compaction (as opposed to
    /// accepting it early), then interrupt the stream.
    pub async fn cancel_compaction(
        &self,
        workspace_id: WorkspaceId,
        request_id: MessageId,
    ) -> Result<()> {
        compact::write_cancel_marker(&self.config, workspace_id, request_id).await?;
        self.interrupt_stream(workspace_id).await
    }

    /// Bounded-time interrupt. The partial is committed before this
    /// returns, so a reload observes the truncated assistant message
    /// immediately.
    pub async fn interrupt_stream(&self, workspace_id: WorkspaceId) -> Result<()> {
        let entry = self.entry(workspace_id)?;
        let Some(running) = entry.state.current_stream() else {
            return Ok(());
        };
        debug!(%workspace_id, message_id = %running.message_id, "interrupting stream");
        running.set_phase(StreamPhase::Aborting);
        running.cancel.cancel();

        tokio::select! {
            _ = running.done.cancelled() => {}
            _ = tokio::time::sleep(INTERRUPT_DEADLINE) => {
                warn!(message_id = %running.message_id, "stream ignored cancellation, force-aborting");
                self.force_finalize_abort(&entry, &running).await;
            }
        }
        Ok(())
    }

    /// Abort any active stream and wait for its finalization; rapid
    /// double-sends therefore cancel the first stream deterministically.
    async fn ensure_stream_safety(&self, entry: &Arc<WorkspaceEntry>) {
        let Some(running) = entry.state.current_stream() else {
            return;
        };
        debug!(message_id = %running.message_id, "replacing active stream");
        running.set_phase(StreamPhase::Aborting);
        running.cancel.cancel();
        tokio::select! {
            _ = running.done.cancelled() => {}
            _ = tokio::time::sleep(REPLACE_DEADLINE) => {
                error!(message_id = %running.message_id, "previous stream never finalized, force-aborting");
                self.force_finalize_abort(entry, &running).await;
            }
        }
        entry.state.clear_stream(running.message_id);
    }

    /// Last-resort finalization after the driver task was hard-aborted:
    /// commit the last flushed snapshot and publish the terminal abort,
    /// unless the driver got there first.
    async fn force_finalize_abort(&self, entry: &Arc<WorkspaceEntry>, running: &RunningStream) {
        running.handle.abort();
        if !running.finalized.swap(true, Ordering::SeqCst) {
            if let Ok(Some(mut partial)) = entry.partial.read().await
                && !partial.parts.is_empty()
            {
                partial.metadata.partial = true;
                entry.history.append(&mut partial).await.ok();
            }
            entry.partial.delete().await.ok();
            self.publish(
                entry.workspace.id,
                ChatEvent::StreamAbort {
                    message_id: running.message_id,
                    metadata: StreamAbortMeta {
                        usage: None,
                        duration_ms: running.started.elapsed().as_millis() as u64,
                        error: None,
                        error_type: None,
                    },
                },
            );
        }
        entry.state.clear_stream(running.message_id);
    }

    /// The send path: everything in the startStream contract plus the
    /// user-message append that allocates its history sequence.
    pub async fn submit(
        self: &Arc<Self>,
        workspace_id: WorkspaceId,
        text: &str,
        options: SendOptions,
    ) -> std::result::Result<MessageId, SendError> {
        let entry = self
            .entry(workspace_id)
            .map_err(|e| SendError::unknown(e.to_string()))?;

        // Compaction requests come in as metadata or as the one slash
        // command the core interprets.
        let compact_command = match &options.mux_metadata {
            Some(MuxMetadata::CompactionRequest { .. }) => None,
            None => compact::parse_compact_command(text),
        };

        let model_string = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        let resolved = self
            .transport
            .resolve(&model_string)
            .map_err(SendError::from)?;

        let mux_metadata = match (&options.mux_metadata, &compact_command) {
            (Some(meta), _) => Some(meta.clone()),
            (None, Some(command)) => Some(
                command
                    .clone()
                    .into_mux_metadata(Some(model_string.clone())),
            ),
            (None, None) => None,
        };
        let compact_params = mux_metadata.as_ref().map(|meta| {
            let MuxMetadata::CompactionRequest {
                target_words,
                continue_message,
                resume_model,
            } = meta;
            let target_tokens = match &compact_command {
                Some(command) => command.target_tokens,
                None => target_words.map(|w| (w as f64 * 1.3).round() as u64),
            };
            (
                target_tokens,
                continue_message.clone(),
                resume_model.clone(),
            )
        });

        // The workspace mutex: serializes sends and covers abort-previous,
        // truncate and append, so two rapid sends interleave
        // deterministically.
        let _guard = entry.state.start_lock.lock().await;
        self.ensure_stream_safety(&entry).await;

        if let Some(edit_id) = options.edit_message_id {
            let before = entry
                .history
                .read()
                .await
                .map_err(|e| SendError::unknown(e.to_string()))?;
            let Some(position) = before.iter().position(|m| m.id == edit_id) else {
                return Err(SendError::unknown(format!(
                    "edit target {edit_id} not found in history"
                )));
            };
            entry
                .history
                .truncate_after(edit_id)
                .await
                .map_err(|e| SendError::unknown(e.to_string()))?;
            for removed in &before[position..] {
                self.publish(workspace_id, ChatEvent::DeleteMessage { id: removed.id });
            }
        }

        let mut user_message = build_user_message(text, &options, mux_metadata);
        let history_sequence = entry
            .history
            .append(&mut user_message)
            .await
            .map_err(|e| SendError::unknown(e.to_string()))?;
        self.publish(
            workspace_id,
            ChatEvent::Message {
                message: user_message.clone(),
            },
        );

        let message_id = MessageId::new();
        if options
            .abort_signal
            .as_ref()
            .is_some_and(|signal| signal.is_cancelled())
        {
            // Aborted before dispatch: the user message stays, nothing else
            // is persisted or started.
            self.publish(
                workspace_id,
                ChatEvent::StreamAbort {
                    message_id,
                    metadata: StreamAbortMeta::default(),
                },
            );
            return Ok(message_id);
        }

        let mode = if compact_params.is_some() {
            compact::COMPACT_MODE.to_string()
        } else {
            options
                .mode
                .clone()
                .unwrap_or_else(|| self.config.default_mode.clone())
        };
        let system_message = build_system_message(SystemMessageInputs {
            mux_home: &self.config.mux_home,
            workspace_dir: &entry.workspace.workspace_path,
            project_dir: Some(&entry.workspace.project_path),
            mode: &mode,
            model: &model_string,
            additional_instructions: options.additional_system_instructions.as_deref(),
        })
        .await
        .map_err(|e| SendError::unknown(e.to_string()))?;

        let mut messages = entry
            .history
            .read()
            .await
            .map_err(|e| SendError::unknown(e.to_string()))?;

        let (max_output_tokens, compaction) = match &compact_params {
            Some((target_tokens, continue_message, resume_model)) => {
                let cap = compact::output_token_cap(&self.config, *target_tokens);
                // The summarization instruction rides along unpersisted.
                messages.push(Message::new(
                    Role::User,
                    vec![MessagePart::text(compact::summarization_prompt(
                        cap,
                        continue_message.as_deref(),
                    ))],
                    now_ms(),
                ));
                (
                    Some(cap),
                    Some(CompactionCtx {
                        request_id: user_message.id,
                        continue_message: continue_message.clone(),
                        resume_model: resume_model.clone(),
                    }),
                )
            }
            None => (options.max_output_tokens, None),
        };

        let previous_response_id = if resolved.capabilities.response_continuity {
            previous_response_id(&messages, &entry.state)
        } else {
            None
        };

        let tools = self.registry.specs();
        let cache_plan = plan_cache_breakpoints(
            messages.len(),
            tools.len(),
            resolved.capabilities.prompt_cache,
        );

        let request = StreamRequest {
            system_message,
            messages,
            tools,
            cache_plan,
            previous_response_id,
            max_output_tokens,
            thinking_level: options.thinking_level.clone(),
            provider_options: options.provider_options,
        };

        let cancel = match &options.abort_signal {
            Some(signal) => signal.child_token(),
            None => CancellationToken::new(),
        };
        let shared = StreamShared {
            cancel,
            done: CancellationToken::new(),
            finalized: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(Mutex::new(StreamPhase::Starting)),
        };

        let job = StreamJob {
            manager: Arc::clone(self),
            entry: Arc::clone(&entry),
            message_id,
            history_sequence,
            model: resolved,
            model_string,
            request,
            policy: options.tool_policy.clone(),
            compaction,
            shared: shared.clone(),
            started: Instant::now(),
        };
        let compaction_request = job.compaction.as_ref().map(|c| c.request_id);
        let driver = tokio::spawn(run_stream(job));

        entry.state.set_stream(RunningStream {
            message_id,
            stream_token: Uuid::new_v4(),
            cancel: shared.cancel,
            done: shared.done,
            finalized: shared.finalized,
            phase: shared.phase,
            handle: Arc::new(AbortOnDropHandle::new(driver)),
            started: Instant::now(),
            compaction_request,
        });

        Ok(message_id)
    }
}

fn build_user_message(
    text: &str,
    options: &SendOptions,
    mux_metadata: Option<MuxMetadata>,
) -> Message {
    let mut parts = vec![MessagePart::text(text)];
    for image in &options.image_parts {
        parts.push(MessagePart::File {
            mime_type: image.mime_type.clone(),
            url: None,
            data: Some(image.data.clone()),
        });
    }
    let mut message = Message::new(Role::User, parts, now_ms());
    message.mux_metadata = mux_metadata;
    message
}

/// Response id of the most recent assistant turn, unless the provider told
/// us it evicted that id.
fn previous_response_id(messages: &[Message], state: &WorkspaceState) -> Option<String> {
    let id = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .find_map(|m| {
            m.metadata
                .provider_metadata
                .as_ref()?
                .get("responseId")?
                .as_str()
                .map(str::to_string)
        })?;
    if state.take_lost_response_id(&id) {
        info!(response_id = %id, "omitting lost response id from request");
        None
    } else {
        Some(id)
    }
}

/// State shared between the driver task and the handles that may finalize
/// it from outside.
#[derive(Clone)]
struct StreamShared {
    cancel: CancellationToken,
    done: CancellationToken,
    finalized: Arc<AtomicBool>,
    phase: Arc<Mutex<StreamPhase>>,
}

impl StreamShared {
    fn set_phase(&self, phase: StreamPhase) {
        if let Ok(mut guard) = self.phase.lock() {
            *guard = phase;
        }
    }
}

struct StreamJob {
    manager: Arc<StreamManager>,
    entry: Arc<WorkspaceEntry>,
    message_id: MessageId,
    history_sequence: u64,
    model: ResolvedModel,
    model_string: String,
    request: StreamRequest,
    policy: ToolPolicy,
    compaction: Option<CompactionCtx>,
    shared: StreamShared,
    started: Instant,
}

impl StreamJob {
    fn publish(&self, event: ChatEvent) {
        self.manager.publish(self.entry.workspace.id, event);
    }
}

enum Outcome {
    Finished {
        partial: Message,
        usage: Option<Usage>,
        provider_metadata: Option<Value>,
    },
    Aborted {
        partial: Message,
        usage: Option<Usage>,
    },
    Failed {
        partial: Message,
        err: MuxErr,
    },
}

async fn run_stream(job: StreamJob) {
    let outcome = if job.shared.cancel.is_cancelled() {
        // Cancelled between registration and startup: nothing was
        // announced, nothing streamed.
        Outcome::Aborted {
            partial: empty_partial(&job),
            usage: None,
        }
    } else {
        job.publish(ChatEvent::StreamStart {
            message_id: job.message_id,
            history_sequence: job.history_sequence,
            model: job.model_string.clone(),
        });
        drive(&job).await
    };

    finalize(&job, outcome).await;

    job.entry.state.clear_stream(job.message_id);
    job.shared.done.cancel();
}

fn empty_partial(job: &StreamJob) -> Message {
    Message {
        id: job.message_id,
        role: Role::Assistant,
        parts: Vec::new(),
        history_sequence: None,
        metadata: MessageMeta {
            timestamp: now_ms(),
            model: Some(job.model_string.clone()),
            partial: true,
            ..Default::default()
        },
        mux_metadata: None,
    }
}

/// Coalesces partial-store writes: flush on structural change or when the
/// configured interval elapsed since the previous flush.
struct PartialFlusher {
    store: PartialStore,
    interval: Duration,
    last_flush: Option<Instant>,
}

impl PartialFlusher {
    fn new(store: PartialStore, interval: Duration) -> Self {
        Self {
            store,
            interval,
            last_flush: None,
        }
    }

    async fn note(&mut self, partial: &Message, structural: bool) {
        let due = structural
            || self
                .last_flush
                .is_none_or(|last| last.elapsed() >= self.interval);
        if !due {
            return;
        }
        if let Err(e) = self.store.write(partial).await {
            warn!(error = %e, "failed to flush partial snapshot");
        }
        self.last_flush = Some(Instant::now());
    }
}

async fn drive(job: &StreamJob) -> Outcome {
    let mut partial = empty_partial(job);

    // Transport invocation with bounded retries for transient failures.
    let mut attempt = 0;
    let stream = loop {
        attempt += 1;
        match job
            .manager
            .transport
            .stream(&job.model, job.request.clone())
            .await
        {
            Ok(stream) => break stream,
            Err(e) if e.is_retryable() && attempt <= MAX_STREAM_RETRIES => {
                warn!(attempt, error = %e, "transport call failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff(attempt)) => {}
                    _ = job.shared.cancel.cancelled() => {
                        return Outcome::Aborted { partial, usage: None };
                    }
                }
            }
            Err(e) => return Outcome::Failed { partial, err: e },
        }
    };

    job.shared.set_phase(StreamPhase::Streaming);
    let mut rx = stream.rx;
    let mut flusher = PartialFlusher::new(
        job.entry.partial.clone(),
        job.manager.config.partial_flush_interval,
    );
    let idle_timeout = job.manager.config.stream_idle_timeout;

    let mut usage: Option<Usage> = None;
    let mut provider_metadata: Option<Value> = None;
    let mut reasoning_open = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = job.shared.cancel.cancelled() => {
                return Outcome::Aborted { partial, usage };
            }
            next = tokio::time::timeout(idle_timeout, rx.recv()) => next,
        };
        let event = match next {
            Err(_) => {
                return Outcome::Failed {
                    partial,
                    err: MuxErr::StreamIdleTimeout(idle_timeout),
                };
            }
            Ok(None) => {
                return Outcome::Failed {
                    partial,
                    err: MuxErr::ProviderTransient("stream closed before finish".to_string()),
                };
            }
            Ok(Some(Err(e))) => return Outcome::Failed { partial, err: e },
            Ok(Some(Ok(event))) => event,
        };

        match event {
            ProviderEvent::Delta { text } => {
                if std::mem::take(&mut reasoning_open) {
                    job.publish(ChatEvent::ReasoningEnd {
                        message_id: job.message_id,
                    });
                }
                let structural = append_text(&mut partial, &text);
                job.publish(ChatEvent::StreamDelta {
                    message_id: job.message_id,
                    delta: text,
                    tokens: None,
                    timestamp: now_ms(),
                });
                flusher.note(&partial, structural).await;
            }
            ProviderEvent::ReasoningDelta { text } => {
                reasoning_open = true;
                let structural = append_reasoning(&mut partial, &text);
                job.publish(ChatEvent::ReasoningDelta {
                    message_id: job.message_id,
                    delta: text,
                    tokens: None,
                });
                flusher.note(&partial, structural).await;
            }
            ProviderEvent::ToolCallDelta { id, input_fragment } => {
                // Forwarded for live rendering; the complete input arrives
                // with the tool-call frame itself.
                job.publish(ChatEvent::ToolCallDelta {
                    message_id: job.message_id,
                    tool_call_id: id,
                    input_patch: input_fragment,
                });
            }
            ProviderEvent::ToolCall { id, name, input } => {
                if std::mem::take(&mut reasoning_open) {
                    job.publish(ChatEvent::ReasoningEnd {
                        message_id: job.message_id,
                    });
                }
                job.publish(ChatEvent::ToolCallStart {
                    message_id: job.message_id,
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                });

                let (output, interrupted) = run_tool(job, &name, input.clone()).await;
                partial.parts.push(MessagePart::ToolCall(ToolCallPart {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                    input,
                    output: Some(output.clone()),
                }));
                job.publish(ChatEvent::ToolCallEnd {
                    message_id: job.message_id,
                    tool_call_id: id,
                    tool_name: name,
                    output,
                });
                flusher.note(&partial, true).await;
                if interrupted {
                    return Outcome::Aborted { partial, usage };
                }
            }
            ProviderEvent::ToolError { id, message } => {
                let output = ToolCallOutput::Error {
                    error: message.clone(),
                };
                attach_tool_output(&mut partial, &id, output.clone());
                let tool_name = partial
                    .tool_call(&id)
                    .map(|part| part.tool_name.clone())
                    .unwrap_or_default();
                job.publish(ChatEvent::ToolCallEnd {
                    message_id: job.message_id,
                    tool_call_id: id,
                    tool_name,
                    output,
                });
                flusher.note(&partial, true).await;
            }
            ProviderEvent::Usage(frame) => {
                usage = Some(frame);
            }
            ProviderEvent::ProviderMetadata(value) => {
                provider_metadata = Some(value);
            }
            ProviderEvent::Finish => {
                if std::mem::take(&mut reasoning_open) {
                    job.publish(ChatEvent::ReasoningEnd {
                        message_id: job.message_id,
                    });
                }
                return Outcome::Finished {
                    partial,
                    usage,
                    provider_metadata,
                };
            }
        }
    }
}

/// Returns true when a new part was opened (a structural change worth an
/// immediate snapshot flush).
fn append_text(partial: &mut Message, text: &str) -> bool {
    if let Some(MessagePart::Text { text: existing }) = partial.parts.last_mut() {
        existing.push_str(text);
        false
    } else {
        partial.parts.push(MessagePart::text(text));
        true
    }
}

fn append_reasoning(partial: &mut Message, text: &str) -> bool {
    if let Some(MessagePart::Reasoning { text: existing }) = partial.parts.last_mut() {
        existing.push_str(text);
        false
    } else {
        partial.parts.push(MessagePart::Reasoning {
            text: text.to_string(),
        });
        true
    }
}

/// Attach an output to the tool-call part with this id, creating the part
/// when the provider failed the call before it ever completed. A part that
/// already has an output is left alone; tool call ids bind to at most one
/// result-or-error.
fn attach_tool_output(partial: &mut Message, tool_call_id: &str, output: ToolCallOutput) {
    for part in &mut partial.parts {
        if let MessagePart::ToolCall(call) = part
            && call.tool_call_id == tool_call_id
        {
            if call.output.is_none() {
                call.output = Some(output);
            }
            return;
        }
    }
    partial.parts.push(MessagePart::ToolCall(ToolCallPart {
        tool_call_id: tool_call_id.to_string(),
        tool_name: String::new(),
        input: Value::Null,
        output: Some(output),
    }));
}

/// Policy check plus execution under the stream's cancellation token. The
/// bool is true when the stream should abort because the call was
/// interrupted.
async fn run_tool(job: &StreamJob, name: &str, input: Value) -> (ToolCallOutput, bool) {
    if job.request.provider_options.simulate_tool_policy_noop || !job.policy.allows(name) {
        // Synthesized result so the model can proceed; the tool is never
        // invoked.
        return (
            ToolCallOutput::Result {
                result: json!({
                    "skipped": true,
                    "reason": format!("tool `{name}` is disabled by policy"),
                }),
            },
            false,
        );
    }
    let Some(tool) = job.manager.registry.get(name) else {
        return (
            ToolCallOutput::Error {
                error: format!("unknown tool `{name}`"),
            },
            false,
        );
    };

    let ctx = ToolCtx {
        runtime: Arc::clone(&job.entry.runtime),
        cwd: job.entry.workspace.workspace_path.clone(),
        cancel: job.shared.cancel.child_token(),
        interrupt_grace: job.manager.config.interrupt_grace,
    };
    let exec = tool.execute(input, &ctx);
    tokio::pin!(exec);

    let result = tokio::select! {
        result = &mut exec => Some(result),
        _ = job.shared.cancel.cancelled() => None,
    };
    let result = match result {
        Some(result) => result,
        None => {
            // Give the tool a bounded window to unwind (kill its children)
            // before the future is dropped.
            let grace = job.manager.config.interrupt_grace * 2;
            match tokio::time::timeout(grace, &mut exec).await {
                Ok(result) => result,
                Err(_) => Err("interrupted".to_string()),
            }
        }
    };

    let interrupted = job.shared.cancel.is_cancelled();
    let output = match result {
        Ok(result) => ToolCallOutput::Result { result },
        Err(error) => ToolCallOutput::Error { error },
    };
    (output, interrupted)
}

async fn finalize(job: &StreamJob, outcome: Outcome) {
    // Whoever flips this flag owns commit and terminal-event publication;
    // the interrupt fallback uses the same flag.
    if job.shared.finalized.swap(true, Ordering::SeqCst) {
        return;
    }
    let duration_ms = job.started.elapsed().as_millis() as u64;

    match outcome {
        Outcome::Finished {
            mut partial,
            usage,
            provider_metadata,
        } => {
            job.shared.set_phase(StreamPhase::Finalizing);
            partial.metadata.partial = false;
            partial.metadata.usage = usage;
            partial.metadata.provider_metadata = provider_metadata.clone();
            partial.metadata.duration_ms = Some(duration_ms);

            if let Some(ctx) = &job.compaction {
                let params = compact::SummaryParams {
                    text: partial.text(),
                    model: job.model_string.clone(),
                    usage,
                    provider_metadata: provider_metadata.clone(),
                    duration_ms,
                    historical_usage: Usage::default(),
                };
                if let Err(e) =
                    compact::apply_compaction(&job.manager, &job.entry, ctx, params).await
                {
                    error!(error = %e, "compaction rewrite failed");
                }
            } else {
                // Commit before announcing: a subscriber that reads history
                // on `stream-end` must find the message there.
                if let Err(e) = job.entry.history.append(&mut partial).await {
                    error!(error = %e, "failed to commit finished stream to history");
                }
                job.entry.partial.delete().await.ok();
            }

            job.publish(ChatEvent::StreamEnd {
                message_id: job.message_id,
                metadata: StreamEndMeta {
                    usage,
                    duration_ms,
                    provider_metadata,
                },
            });
        }
        Outcome::Aborted { mut partial, usage } => {
            job.shared.set_phase(StreamPhase::Aborting);

            if let Some(ctx) = &job.compaction {
                if compact::take_cancel_marker(
                    &job.manager.config,
                    job.entry.workspace.id,
                    ctx.request_id,
                )
                .await
                {
                    // True cancel: throw the summary away.
                    job.entry.partial.delete().await.ok();
                } else {
                    // Accept early: keep what we have, marked truncated.
                    let params = compact::SummaryParams {
                        text: format!("{}{}", partial.text(), compact::TRUNCATED_SENTINEL),
                        model: job.model_string.clone(),
                        usage,
                        provider_metadata: None,
                        duration_ms,
                        historical_usage: Usage::default(),
                    };
                    if let Err(e) =
                        compact::apply_compaction(&job.manager, &job.entry, ctx, params).await
                    {
                        error!(error = %e, "early-accept compaction rewrite failed");
                    }
                }
            } else if !partial.parts.is_empty() {
                partial.metadata.partial = true;
                partial.metadata.usage = usage;
                partial.metadata.duration_ms = Some(duration_ms);
                if let Err(e) = job.entry.history.append(&mut partial).await {
                    error!(error = %e, "failed to commit aborted partial to history");
                }
                job.entry.partial.delete().await.ok();
            } else {
                // Nothing accumulated: nothing worth persisting.
                job.entry.partial.delete().await.ok();
            }

            job.publish(ChatEvent::StreamAbort {
                message_id: job.message_id,
                metadata: StreamAbortMeta {
                    usage,
                    duration_ms,
                    error: None,
                    error_type: None,
                },
            });
        }
        Outcome::Failed { mut partial, err } => {
            job.shared.set_phase(StreamPhase::Errored);
            if let Some(lost) = lost_response_id_in(&err.to_string()) {
                info!(response_id = %lost, "provider lost its response anchor");
                job.entry.state.record_lost_response_id(lost);
            }
            let error_type = err.stream_error_type();
            let error_text = err.to_string();

            // Persist the failure in place so a reload shows it; compaction
            // streams leave history untouched on failure.
            if job.compaction.is_none() {
                partial.metadata.partial = true;
                partial.metadata.error = Some(error_text.clone());
                partial.metadata.error_type = Some(error_type);
                partial.metadata.duration_ms = Some(duration_ms);
                if let Err(e) = job.entry.history.append(&mut partial).await {
                    error!(error = %e, "failed to commit failed partial to history");
                }
            }
            job.entry.partial.delete().await.ok();

            job.publish(ChatEvent::StreamError {
                message_id: job.message_id,
                error: error_text,
                error_type,
            });
        }
    }
}
