//! Conversation compaction: `/compact` parsing, the constrained
//! summarization prompt, and the atomic history rewrite.
//!
//! A compaction runs as a normal stream (same manager, same events); what
//! differs is the finalization: instead of appending the assistant message,
//! the whole log is replaced by it, with the discarded usage summed onto
//! the survivor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mux_protocol::Message;
use mux_protocol::MessageId;
use mux_protocol::MessageMeta;
use mux_protocol::MessagePart;
use mux_protocol::MuxMetadata;
use mux_protocol::Role;
use mux_protocol::Usage;
use mux_protocol::WorkspaceId;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::util::now_ms;

/// Mode forced onto every summarization stream so instruction files can
/// scope guidance to it.
pub const COMPACT_MODE: &str = "compact";

/// Appended to a summary accepted early (stream aborted without a cancel
/// marker), so readers can tell it was cut short.
pub const TRUNCATED_SENTINEL: &str = "\n\n[truncated]";

/// Tokens per word of English prose; the word target for a summary is its
/// token budget divided by this.
const TOKENS_PER_WORD: f64 = 1.3;

fn words_for_tokens(tokens: u64) -> u64 {
    (tokens as f64 / TOKENS_PER_WORD).round() as u64
}

/// A parsed `/compact [-t tokens] [-c continue-message]` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactCommand {
    pub target_tokens: Option<u64>,
    pub continue_message: Option<String>,
}

/// Everything the stream driver needs to finalize a compaction.
#[derive(Debug, Clone)]
pub(crate) struct CompactionCtx {
    pub request_id: MessageId,
    pub continue_message: Option<String>,
    pub resume_model: Option<String>,
}

/// Recognize a compaction request. Returns `None` for every other text,
/// including other slash commands (which the core does not interpret).
pub fn parse_compact_command(text: &str) -> Option<CompactCommand> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix("/compact")?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let mut command = CompactCommand::default();
    // `-c` consumes the remainder of the line, spaces included.
    let (flags_part, continue_part) = match rest.split_once("-c") {
        Some((before, after)) => (before, Some(after.trim())),
        None => (rest, None),
    };
    if let Some(message) = continue_part
        && !message.is_empty()
    {
        command.continue_message = Some(message.to_string());
    }

    let mut words = flags_part.split_whitespace();
    while let Some(word) = words.next() {
        match word {
            "-t" => {
                command.target_tokens = words.next().and_then(|n| n.parse().ok());
            }
            other => {
                debug!(flag = other, "ignoring unknown /compact flag");
            }
        }
    }
    Some(command)
}

impl CompactCommand {
    pub fn into_mux_metadata(self, resume_model: Option<String>) -> MuxMetadata {
        MuxMetadata::CompactionRequest {
            target_words: self.target_tokens.map(words_for_tokens),
            continue_message: self.continue_message,
            resume_model,
        }
    }
}

/// Output budget for the summarization stream: the requested target capped
/// by the configured maximum.
pub(crate) fn output_token_cap(config: &Config, target_tokens: Option<u64>) -> u64 {
    target_tokens
        .unwrap_or(config.compact_output_token_cap)
        .min(config.compact_output_token_cap)
}

/// The synthesized user turn appended (unpersisted) to the outgoing message
/// array of a summarization stream.
pub(crate) fn summarization_prompt(max_output_tokens: u64, continue_message: Option<&str>) -> String {
    let target_words = words_for_tokens(max_output_tokens);
    let mut prompt = format!(
        "Summarize this conversation so a fresh session can continue the work \
         seamlessly. Target roughly {target_words} words. Preserve: the \
         user's goals and constraints, what was attempted, what is done, \
         current file and code state, and any unresolved problems. Omit \
         pleasantries and dead ends unless they constrain future work."
    );
    if let Some(message) = continue_message {
        prompt.push_str(&format!(
            "\n\nAfter the summary is applied, the conversation continues \
             with this user message, so keep everything it depends on:\n{message}"
        ));
    }
    prompt
}

/// Sum of everything a compaction is about to discard, including the
/// historical usage carried by earlier summaries so repeated compactions
/// never lose cost accounting.
pub(crate) fn historical_usage_of(messages: &[Message]) -> Usage {
    let mut total = Usage::default();
    for message in messages {
        if let Some(usage) = &message.metadata.usage {
            total = total.add(usage);
        }
        if let Some(historical) = &message.metadata.historical_usage {
            total = total.add(historical);
        }
    }
    total
}

pub(crate) struct SummaryParams {
    pub text: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub provider_metadata: Option<Value>,
    pub duration_ms: u64,
    pub historical_usage: Usage,
}

pub(crate) fn build_summary_message(params: SummaryParams) -> Message {
    Message {
        id: MessageId::new(),
        role: Role::Assistant,
        parts: vec![MessagePart::text(params.text)],
        history_sequence: None,
        metadata: MessageMeta {
            timestamp: now_ms(),
            model: Some(params.model),
            usage: params.usage,
            provider_metadata: params.provider_metadata,
            duration_ms: Some(params.duration_ms),
            partial: false,
            compacted: true,
            historical_usage: Some(params.historical_usage),
            error: None,
            error_type: None,
        },
        mux_metadata: None,
    }
}

/// Cancel-marker plumbing. The marker is written by the explicit cancel
/// path; its presence at abort time distinguishes "throw the summary away"
/// from "accept what we have so far".
pub(crate) async fn write_cancel_marker(
    config: &Config,
    workspace_id: WorkspaceId,
    request_id: MessageId,
) -> Result<()> {
    let path = config.compact_cancel_marker_path(workspace_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, request_id.to_string()).await?;
    Ok(())
}

/// True (and removes the marker) when a cancel was recorded for this
/// request.
pub(crate) async fn take_cancel_marker(
    config: &Config,
    workspace_id: WorkspaceId,
    request_id: MessageId,
) -> bool {
    let path = config.compact_cancel_marker_path(workspace_id);
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
        Err(e) => {
            warn!(error = %e, "failed to read compaction cancel marker");
            return false;
        }
    };
    if contents.trim() != request_id.to_string() {
        return false;
    }
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(error = %e, "failed to remove compaction cancel marker");
    }
    true
}

/// Apply a finished summarization to the workspace: dedupe by request id,
/// rewrite history, surface the summary, then emit the follow-up send when
/// one was requested. Returns whether the rewrite happened.
pub(crate) fn apply_compaction<'a>(
    manager: &'a Arc<crate::stream::StreamManager>,
    entry: &'a Arc<crate::stream::WorkspaceEntry>,
    ctx: &'a CompactionCtx,
    params: SummaryParams,
) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
    Box::pin(apply_compaction_inner(manager, entry, ctx, params))
}

async fn apply_compaction_inner(
    manager: &Arc<crate::stream::StreamManager>,
    entry: &Arc<crate::stream::WorkspaceEntry>,
    ctx: &CompactionCtx,
    params: SummaryParams,
) -> Result<bool> {
    if !entry.state.mark_compaction_applied(ctx.request_id) {
        debug!(request_id = %ctx.request_id, "compaction already applied, skipping");
        return Ok(false);
    }

    let prior = entry.history.read().await?;
    let mut summary = build_summary_message(SummaryParams {
        historical_usage: historical_usage_of(&prior),
        ..params
    });
    entry.history.replace_all(&mut summary).await?;
    entry.partial.delete().await?;
    info!(
        workspace_id = %entry.workspace.id,
        discarded = prior.len(),
        "compacted history into a single summary message"
    );

    manager.publish(
        entry.workspace.id,
        mux_protocol::ChatEvent::Message {
            message: summary.clone(),
        },
    );

    if let (Some(resume_model), Some(continue_message)) =
        (ctx.resume_model.clone(), ctx.continue_message.clone())
    {
        // Compaction-only options (compact mode, the output cap, the
        // metadata record) are deliberately absent from the follow-up.
        let manager = Arc::clone(manager);
        let workspace_id = entry.workspace.id;
        tokio::spawn(async move {
            let options = crate::stream::SendOptions {
                model: Some(resume_model),
                ..Default::default()
            };
            if let Err(e) = manager
                .submit(workspace_id, &continue_message, options)
                .await
            {
                warn!(%workspace_id, error = ?e, "post-compaction follow-up send failed");
            }
        });
    }

    Ok(true)
}
