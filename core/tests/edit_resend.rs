//! Editing a message while a stream is active: abort previous, truncate at
//! the edited id, start fresh.

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
use pretty_assertions::assert_eq;

const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edit_during_stream_truncates_and_restarts() {
    let mux = TestMux::new();
    let rx = mux.subscribe().await;

    // A completed first exchange, then a second stream parked mid-delta.
    mux.transport.push(ok_script("first answer"));
    mux.manager
        .send_message(mux.workspace_id, "first question", SendOptions::default())
        .await;
    wait_terminal(&rx, DEADLINE).await;

    mux.transport.push(Script::Hang(vec![Step::Event(
        ProviderEvent::Delta {
            text: "half an answer".to_string(),
        },
    )]));
    mux.manager
        .send_message(mux.workspace_id, "second question", SendOptions::default())
        .await;
    wait_for(&rx, DEADLINE, |e| {
        matches!(e, ChatEvent::StreamDelta { .. })
    })
    .await;

    let edited_id = mux
        .manager
        .read_history(mux.workspace_id)
        .await
        .unwrap()
        .iter()
        .find(|m| m.text() == "second question")
        .unwrap()
        .id;

    // Edit-resend: the active stream aborts, the edited message and its
    // descendants vanish, the new prompt streams.
    mux.transport.push(ok_script("revised answer"));
    let response = mux
        .manager
        .send_message(
            mux.workspace_id,
            "revised question",
            SendOptions {
                edit_message_id: Some(edited_id),
                ..Default::default()
            },
        )
        .await;
    assert!(response.success());

    // Ordering: abort of the old stream, deletion of the edited message,
    // then the replacement stream's lifecycle.
    let mut deleted = Vec::new();
    let mut aborted = false;
    loop {
        let event = wait_for(&rx, DEADLINE, |_| true).await;
        match &event {
            ChatEvent::StreamAbort { .. } => aborted = true,
            ChatEvent::DeleteMessage { id } => deleted.push(*id),
            ChatEvent::StreamEnd { .. } => break,
            _ => {}
        }
    }
    assert!(aborted);
    assert!(deleted.contains(&edited_id));

    let history = mux.manager.read_history(mux.workspace_id).await.unwrap();
    let texts: Vec<String> = history.iter().map(|m| m.text()).collect();
    assert_eq!(
        texts,
        vec![
            "first question".to_string(),
            "first answer".to_string(),
            "revised question".to_string(),
            "revised answer".to_string(),
        ]
    );
    assert_eq!(history[2].role, Role::User);
    // Sequences stay strictly monotonic across the truncation.
    let seqs: Vec<u64> = history
        .iter()
        .map(|m| m.history_sequence.unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edit_of_unknown_message_fails_the_send() {
    let mux = TestMux::new();
    let response = mux
        .manager
        .send_message(
            mux.workspace_id,
            "text",
            SendOptions {
                edit_message_id: Some(mux_protocol::MessageId::new()),
                ..Default::default()
            },
        )
        .await;
    assert!(!response.success());
    assert!(
        mux.manager
            .read_history(mux.workspace_id)
            .await
            .unwrap()
            .is_empty()
    );
}
