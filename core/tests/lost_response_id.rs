//! Recovery when the provider evicts its reasoning-continuity anchor: the
//! send after the failure omits the lost response id.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::FailKind;
use common::Script;
use common::Step;
use common::TestMux;
use common::wait_terminal;
use mux_core::SendOptions;
use mux_core::transport::ProviderEvent;
use mux_protocol::ChatEvent;
use mux_protocol::Usage;
use pretty_assertions::assert_eq;
use serde_json::json;

const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_response_id_is_omitted_on_the_next_send() {
    let mux = TestMux::new();
    let rx = mux.subscribe().await;

    // Send 1 finishes normally and hands back a response id.
    mux.transport.push(Script::Events(vec![
        Step::Event(ProviderEvent::Delta {
            text: "anchored".to_string(),
        }),
        Step::Event(ProviderEvent::ProviderMetadata(
            json!({"responseId": "resp_abc"}),
        )),
        Step::Event(ProviderEvent::Usage(Usage::default())),
        Step::Event(ProviderEvent::Finish),
    ]));
    mux.manager
        .send_message(mux.workspace_id, "first", SendOptions::default())
        .await;
    assert!(matches!(
        wait_terminal(&rx, DEADLINE).await,
        ChatEvent::StreamEnd { .. }
    ));

    // Send 2: the provider no longer has that id.
    mux.transport.push(Script::Fail(FailKind::Unknown(
        "Previous response with id 'resp_abc' not found".to_string(),
    )));
    mux.manager
        .send_message(mux.workspace_id, "second", SendOptions::default())
        .await;
    assert!(matches!(
        wait_terminal(&rx, DEADLINE).await,
        ChatEvent::StreamError { .. }
    ));
    // The failing request did echo the id; that is what the provider
    // rejected.
    assert_eq!(
        mux.transport.request(1).previous_response_id.as_deref(),
        Some("resp_abc")
    );

    // Send 3 omits the lost id and completes normally.
    mux.manager
        .send_message(mux.workspace_id, "third", SendOptions::default())
        .await;
    assert!(matches!(
        wait_terminal(&rx, DEADLINE).await,
        ChatEvent::StreamEnd { .. }
    ));
    assert_eq!(mux.transport.request(2).previous_response_id, None);
}
