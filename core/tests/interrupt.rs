//! Interrupting a stream that is blocked inside a long-running tool
//! process: the interrupt returns quickly, the child dies, and the partial
//! lands in history.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;
use std::time::Instant;

use common::Script;
use common::Step;
use common::TestMux;
use common::wait_for;
use mux_core::SendOptions;
use mux_core::transport::ProviderEvent;
use mux_protocol::ChatEvent;
use mux_protocol::MessagePart;
use mux_protocol::Role;
use pretty_assertions::assert_eq;
use serde_json::json;

const DEADLINE: Duration = Duration::from_secs(5);

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_during_sleeping_tool_returns_within_bound() {
    let mux = TestMux::new();
    let rx = mux.subscribe().await;
    mux.transport.push(Script::Hang(vec![
        Step::Event(ProviderEvent::Delta {
            text: "running it now: ".to_string(),
        }),
        Step::Event(ProviderEvent::ToolCall {
            id: "call_sleep".to_string(),
            name: "shell".to_string(),
            input: json!({"command": "sleep 60"}),
        }),
    ]));

    mux.manager
        .send_message(mux.workspace_id, "please sleep 60", SendOptions::default())
        .await;

    wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::ToolCallStart { .. })
    })
    .await;

    let started = Instant::now();
    mux.manager.interrupt_stream(mux.workspace_id).await.unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "interrupt took {elapsed:?}"
    );

    let abort = wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::StreamAbort { .. })
    })
    .await;
    drop(abort);

    // Reload view: the truncated assistant message is already durable.
    let history = mux.manager.read_history(mux.workspace_id).await.unwrap();
    assert_eq!(history.len(), 2);
    let assistant = &history[1];
    assert_eq!(assistant.role, Role::Assistant);
    assert!(assistant.metadata.partial);
    assert_eq!(assistant.text(), "running it now: ");
    assert!(
        assistant
            .parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolCall(call) if call.tool_call_id == "call_sleep"))
    );
    assert_eq!(mux.manager.read_partial(mux.workspace_id).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_with_no_active_stream_is_a_noop() {
    let mux = TestMux::new();
    mux.manager.interrupt_stream(mux.workspace_id).await.unwrap();
    assert!(
        mux.manager
            .read_history(mux.workspace_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pre_fired_abort_signal_skips_the_stream_entirely() {
    let mux = TestMux::new();
    let rx = mux.subscribe().await;

    let signal = tokio_util::sync::CancellationToken::new();
    signal.cancel();
    let response = mux
        .manager
        .send_message(
            mux.workspace_id,
            "never started",
            SendOptions {
                abort_signal: Some(signal),
                ..Default::default()
            },
        )
        .await;
    assert!(response.success());

    wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::StreamAbort { .. })
    })
    .await;

    // The user message persisted; no assistant message ever did, and no
    // provider call was made.
    let history = mux.manager.read_history(mux.workspace_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(mux.transport.request_count(), 0);
}
