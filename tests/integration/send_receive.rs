// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Integration tests for the optimistic send path.
//!
//! Runs a full [`SyncEngine`] against the loopback backend and checks that
//! every send ends in exactly one confirmed message or none at all:
//! - a plain send is promoted in place (timeline length unchanged)
//! - the echo push and the ack can arrive in either order
//! - a failed upload removes the provisional message and its preview
//! - rejections, timeouts and offline sends hand the draft back
//! - a rolled-back send disappears from the conversation list too

use std::sync::Arc;
use std::time::Duration;

use haggle::chat::history::InMemoryApi;
use haggle::chat::media::{InMemoryUploader, OutgoingAttachment};
use haggle::chat::send::{Draft, SendError};
use haggle::config::ClientConfig;
use haggle::engine::SyncEngine;
use haggle::timeline::Promotion;
use haggle::transport::Credentials;
use haggle::transport::loopback::{AckMode, LoopbackConnector, LoopbackServer};
use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::{MessageId, Timestamp, UserId, WireMessage};

type Engine = SyncEngine<LoopbackConnector, Arc<InMemoryApi>, Arc<InMemoryUploader>>;

// =============================================================================
// Helpers
// =============================================================================

struct Fixture {
    server: LoopbackServer,
    uploader: Arc<InMemoryUploader>,
    engine: Engine,
}

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

async fn start() -> Fixture {
    let (server, connector) = LoopbackServer::new();
    let mut config = ClientConfig::defaults();
    config.send.ack_timeout = Duration::from_millis(300);
    let api = Arc::new(InMemoryApi::new());
    let uploader = Arc::new(InMemoryUploader::new());
    let engine = SyncEngine::start(
        &config,
        connector,
        api,
        Arc::clone(&uploader),
        Credentials::new(alice(), "token"),
    )
    .await
    .unwrap();
    Fixture {
        server,
        uploader,
        engine,
    }
}

/// Wait until `check` holds, polling every few milliseconds.
async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_send_frame(server: &LoopbackServer) -> ClientEvent {
    loop {
        let frame = server.next_frame().await.expect("frame stream ended");
        if matches!(frame, ClientEvent::SendMessage { .. }) {
            return frame;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn send_is_promoted_in_place() {
    let f = start().await;
    f.server.set_ack_mode(AckMode::Hold);

    let pending = f.engine.submit(Draft::text(bob(), "Hello")).unwrap();
    let before = f.engine.timeline(&bob());
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].body, "Hello");
    assert_eq!(before[0].id, MessageId::Provisional(pending.provisional_id));

    next_send_frame(&f.server).await;
    f.server.release_acks();
    let receipt = pending.outcome().await.unwrap();

    let after = f.engine.timeline(&bob());
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].body, "Hello");
    assert_eq!(after[0].id, receipt.message.id);
    assert!(matches!(after[0].id, MessageId::Confirmed(_)));
    assert_eq!(receipt.promotion, Promotion::Replaced);
}

#[tokio::test]
async fn echo_push_before_ack_yields_one_message() {
    let f = start().await;
    f.server.set_ack_mode(AckMode::PushThenConfirm);

    let receipt = f.engine.send(Draft::text(bob(), "Hello")).await.unwrap();
    eventually(|| f.engine.timeline(&bob()).iter().all(|m| !m.id.is_provisional())).await;

    let timeline = f.engine.timeline(&bob());
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].id, receipt.message.id);
}

#[tokio::test]
async fn ack_before_echo_push_yields_one_message() {
    let f = start().await;
    f.server.set_ack_mode(AckMode::ConfirmThenPush);

    f.engine.send(Draft::text(bob(), "first")).await.unwrap();
    f.engine.send(Draft::text(bob(), "second")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bodies: Vec<String> = f
        .engine
        .timeline(&bob())
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec!["first", "second"]);
}

#[tokio::test]
async fn incoming_message_lands_in_timeline() {
    let f = start().await;
    f.engine.select_conversation(&bob()).await.unwrap();

    let pushed = ServerEvent::NewMessage {
        message: WireMessage {
            id: Some("srv-77".into()),
            conversation_id: Some("conv-alice-bob".into()),
            sender_id: bob(),
            receiver_id: alice(),
            body: "is the bike still available?".into(),
            attachment: None,
            created_at: Timestamp::now(),
            is_read: false,
            offer: None,
            client_ref: None,
        },
    };
    assert!(f.server.push(&pushed));
    assert!(f.server.push(&pushed));
    eventually(|| f.engine.timeline(&bob()).len() == 1).await;
    eventually(|| {
        f.engine
            .conversations()
            .first()
            .is_some_and(|c| c.unread_count == 1)
    })
    .await;

    assert_eq!(f.engine.mark_read(&bob()).await.unwrap(), 1);
    assert!(f.engine.timeline(&bob())[0].is_read);
}

#[tokio::test]
async fn failed_upload_leaves_no_trace() {
    let f = start().await;
    f.uploader.set_failing(true);

    let draft = Draft {
        counterpart: bob(),
        body: "photo".into(),
        attachment: Some(OutgoingAttachment::new("bike.jpg", "image/jpeg", vec![0xFF; 64])),
    };
    let pending = f.engine.submit(draft).unwrap();
    let preview = f.engine.timeline(&bob());
    assert_eq!(preview.len(), 1);
    assert!(preview[0].attachment.as_ref().unwrap().pending);

    let failure = pending.outcome().await.unwrap_err();
    assert!(matches!(failure.error, SendError::Upload(_)));
    assert_eq!(failure.draft.attachment.unwrap().file_name, "bike.jpg");
    assert!(f.engine.timeline(&bob()).is_empty());
    assert!(
        !f.server
            .received()
            .iter()
            .any(|frame| matches!(frame, ClientEvent::SendMessage { .. }))
    );
}

#[tokio::test]
async fn uploaded_attachment_is_sent_with_message() {
    let f = start().await;
    let draft = Draft {
        counterpart: bob(),
        body: String::new(),
        attachment: Some(OutgoingAttachment::new("bike.jpg", "image/jpeg", vec![1, 2, 3])),
    };
    let receipt = f.engine.send(draft).await.unwrap();

    let attachment = receipt.message.attachment.unwrap();
    assert!(!attachment.pending);
    assert!(attachment.url.starts_with("memory://"));
    assert_eq!(f.uploader.stored(), vec!["bike.jpg"]);
    let timeline = f.engine.timeline(&bob());
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].attachment.as_ref().unwrap().url, attachment.url);
}

#[tokio::test]
async fn rejection_and_timeout_roll_back() {
    let f = start().await;

    f.server.set_ack_mode(AckMode::Reject("recipient blocked you".into()));
    let failure = f.engine.send(Draft::text(bob(), "hi")).await.unwrap_err();
    assert!(matches!(failure.error, SendError::Rejected(_)));
    assert!(failure.provisional_id.is_some());
    assert!(f.engine.timeline(&bob()).is_empty());
    eventually(|| {
        f.engine
            .conversations()
            .iter()
            .any(|c| c.counterpart == bob() && c.last_message_summary.is_none())
    })
    .await;

    f.server.set_ack_mode(AckMode::Silent);
    let failure = f.engine.send(Draft::text(bob(), "anyone?")).await.unwrap_err();
    assert!(matches!(failure.error, SendError::Timeout));
    assert_eq!(failure.draft.body, "anyone?");
    assert!(f.engine.timeline(&bob()).is_empty());
}

#[tokio::test]
async fn offline_send_is_refused_up_front() {
    let (server, connector) = LoopbackServer::new();
    let mut config = ClientConfig::defaults();
    config.transport.reconnect.max_attempts = 1;
    config.transport.reconnect.initial_delay = Duration::from_millis(10);
    let engine: Engine = SyncEngine::start(
        &config,
        connector,
        Arc::new(InMemoryApi::new()),
        Arc::new(InMemoryUploader::new()),
        Credentials::new(alice(), "token"),
    )
    .await
    .unwrap();

    server.refuse_connections(true);
    server.drop_connection();
    eventually(|| !engine.connection().is_connected()).await;

    let failure = engine.submit(Draft::text(bob(), "hello?")).unwrap_err();
    assert!(matches!(failure.error, SendError::NotConnected));
    assert!(failure.provisional_id.is_none());
    assert!(engine.timeline(&bob()).is_empty());
}
