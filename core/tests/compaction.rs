//! `/compact`: history collapses to a single summary message carrying the
//! discarded usage, with cancel and accept-early semantics on abort.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::Script;
use common::Step;
use common::TestMux;
use common::ok_script;
use common::wait_for;
use common::wait_terminal;
use mux_core::SendOptions;
use mux_core::transport::ProviderEvent;
use mux_protocol::ChatEvent;
use mux_protocol::Role;
use mux_protocol::Usage;
use pretty_assertions::assert_eq;

const DEADLINE: Duration = Duration::from_secs(5);

/// Two completed exchanges so there is something to compact; `ok_script`
/// charges 10 input + 5 output tokens per assistant turn.
async fn seed_history(mux: &TestMux) {
    let rx = mux.subscribe().await;
    for text in ["start the work", "continue the work"] {
        mux.transport.push(ok_script("done"));
        mux.manager
            .send_message(mux.workspace_id, text, SendOptions::default())
            .await;
        wait_terminal(&rx, DEADLINE).await;
    }
}

fn summary_script() -> Script {
    Script::Events(vec![
        Step::Event(ProviderEvent::Delta {
            text: "summary of the work so far".to_string(),
        }),
        Step::Event(ProviderEvent::Usage(Usage {
            input_tokens: 3,
            output_tokens: 2,
            ..Default::default()
        })),
        Step::Event(ProviderEvent::Finish),
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compact_replaces_history_and_preserves_usage() {
    let mux = TestMux::new();
    seed_history(&mux).await;
    let rx = mux.subscribe().await;
    mux.transport.push(summary_script());

    mux.manager
        .send_message(mux.workspace_id, "/compact -t 5000", SendOptions::default())
        .await;

    // The summary is surfaced as a whole-message event before the stream's
    // terminal.
    let mut saw_summary_event = false;
    loop {
        let event = wait_for(&rx, DEADLINE, |_| true).await;
        if let ChatEvent::Message { message } = &event
            && message.metadata.compacted
        {
            saw_summary_event = true;
        }
        if event.is_terminal() {
            assert!(matches!(event, ChatEvent::StreamEnd { .. }));
            break;
        }
    }
    assert!(saw_summary_event);

    let history = mux.manager.read_history(mux.workspace_id).await.unwrap();
    assert_eq!(history.len(), 1);
    let summary = &history[0];
    assert_eq!(summary.role, Role::Assistant);
    assert!(summary.metadata.compacted);
    assert_eq!(summary.text(), "summary of the work so far");
    // Cost accounting survives the rewrite: two assistant turns at 10/5
    // each were discarded.
    let historical = summary.metadata.historical_usage.unwrap();
    assert_eq!(historical.input_tokens, 20);
    assert_eq!(historical.output_tokens, 10);
    assert_eq!(summary.metadata.usage.unwrap().output_tokens, 2);

    // The summarization stream was constrained: capped output budget and a
    // synthesized prompt as the final outgoing message.
    let request = mux.transport.request(2);
    assert_eq!(request.max_output_tokens, Some(5000));
    let prompt = request.messages.last().unwrap();
    assert!(prompt.text().contains("Summarize this conversation"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compact_with_continue_message_resends_on_the_original_model() {
    let mux = TestMux::new();
    seed_history(&mux).await;
    let rx = mux.subscribe().await;
    mux.transport.push(summary_script());
    mux.transport.push(ok_script("continuing"));

    mux.manager
        .send_message(
            mux.workspace_id,
            "/compact -t 5000 -c keep going",
            SendOptions::default(),
        )
        .await;

    // Two terminals: the summarization stream, then the auto follow-up.
    assert!(matches!(
        wait_terminal(&rx, DEADLINE).await,
        ChatEvent::StreamEnd { .. }
    ));
    assert!(matches!(
        wait_terminal(&rx, DEADLINE).await,
        ChatEvent::StreamEnd { .. }
    ));

    let history = mux.manager.read_history(mux.workspace_id).await.unwrap();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::Assistant, Role::User, Role::Assistant]);
    assert!(history[0].metadata.compacted);
    assert_eq!(history[1].text(), "keep going");
    assert_eq!(history[2].text(), "continuing");

    // The follow-up saw the compacted history, not the original turns, and
    // dropped the compaction-only output cap.
    let follow_up = mux.transport.request(3);
    assert!(follow_up.messages[0].metadata.compacted);
    assert_eq!(follow_up.max_output_tokens, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_compaction_leaves_history_alone() {
    let mux = TestMux::new();
    seed_history(&mux).await;
    let rx = mux.subscribe().await;
    mux.transport.push(Script::Hang(vec![Step::Event(
        ProviderEvent::Delta {
            text: "partial summary".to_string(),
        },
    )]));

    mux.manager
        .send_message(mux.workspace_id, "/compact", SendOptions::default())
        .await;
    wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::StreamDelta { .. })
    })
    .await;

    // The request id is the user message carrying the compaction record.
    let history = mux.manager.read_history(mux.workspace_id).await.unwrap();
    let request_id = history
        .iter()
        .rev()
        .find(|m| m.mux_metadata.is_some())
        .unwrap()
        .id;

    mux.manager
        .cancel_compaction(mux.workspace_id, request_id)
        .await
        .unwrap();
    wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::StreamAbort { .. })
    })
    .await;

    // True cancel: no rewrite happened, the seeded turns plus the /compact
    // user message are all still there.
    let after = mux.manager.read_history(mux.workspace_id).await.unwrap();
    assert_eq!(after.len(), 5);
    assert!(after.iter().all(|m| !m.metadata.compacted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_compaction_accepts_the_partial_summary() {
    let mux = TestMux::new();
    seed_history(&mux).await;
    let rx = mux.subscribe().await;
    mux.transport.push(Script::Hang(vec![Step::Event(
        ProviderEvent::Delta {
            text: "partial summary".to_string(),
        },
    )]));

    mux.manager
        .send_message(mux.workspace_id, "/compact", SendOptions::default())
        .await;
    wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::StreamDelta { .. })
    })
    .await;

    // Plain interrupt, no cancel marker: accept what we have.
    mux.manager.interrupt_stream(mux.workspace_id).await.unwrap();
    wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::StreamAbort { .. })
    })
    .await;

    let history = mux.manager.read_history(mux.workspace_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].metadata.compacted);
    assert_eq!(history[0].text(), "partial summary\n\n[truncated]");
}
