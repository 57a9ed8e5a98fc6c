// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Integration tests for merging REST history with local and pushed state.
//!
//! Validates:
//! - history arriving while sends are in flight keeps the provisional messages
//! - re-loading the same page is a no-op
//! - a history record matching an unacknowledged send replaces it
//! - older pages slot in before newer ones; malformed records are skipped
//! - switching conversations discards the previous timeline
//! - pushes for background conversations do not pile up across switches

use std::sync::Arc;
use std::time::Duration;

use haggle::chat::history::InMemoryApi;
use haggle::chat::media::InMemoryUploader;
use haggle::chat::send::Draft;
use haggle::config::ClientConfig;
use haggle::engine::SyncEngine;
use haggle::transport::Credentials;
use haggle::transport::loopback::{AckMode, LoopbackConnector, LoopbackServer};
use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::{
    ConversationKey, MessageId, Timestamp, UserId, WireConversation, WireMessage,
};

type Engine = SyncEngine<LoopbackConnector, Arc<InMemoryApi>, Arc<InMemoryUploader>>;

// =============================================================================
// Helpers
// =============================================================================

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

/// A history record `minutes_ago` minutes before now, alternating authors.
fn record(n: u64, minutes_ago: u64) -> WireMessage {
    let (sender_id, receiver_id) = if n % 2 == 0 {
        (alice(), bob())
    } else {
        (bob(), alice())
    };
    let now = Timestamp::now().as_millis();
    WireMessage {
        id: Some(format!("h{n:02}")),
        conversation_id: Some("conv-alice-bob".into()),
        sender_id,
        receiver_id,
        body: format!("history {n}"),
        attachment: None,
        created_at: Timestamp::from_millis(now - minutes_ago * 60_000),
        is_read: true,
        offer: None,
        client_ref: None,
    }
}

async fn start(api: Arc<InMemoryApi>) -> (LoopbackServer, Engine) {
    let (server, connector) = LoopbackServer::new();
    let mut config = ClientConfig::defaults();
    config.send.ack_timeout = Duration::from_secs(2);
    let engine = SyncEngine::start(
        &config,
        connector,
        api,
        Arc::new(InMemoryUploader::new()),
        Credentials::new(alice(), "token"),
    )
    .await
    .unwrap();
    (server, engine)
}

async fn wait_for_sends(server: &LoopbackServer, count: usize) {
    let mut seen = 0;
    while seen < count {
        if matches!(server.next_frame().await, Some(ClientEvent::SendMessage { .. })) {
            seen += 1;
        }
    }
}

fn assert_sorted(engine: &Engine) {
    let times: Vec<u64> = engine
        .timeline(&bob())
        .iter()
        .map(|m| m.created_at.as_millis())
        .collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]), "timeline out of order");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn history_keeps_unacknowledged_sends() {
    let api = Arc::new(InMemoryApi::new());
    api.insert_messages(&bob(), (0..20).map(|n| record(n, 100 - n)).collect());
    let (server, engine) = start(Arc::clone(&api)).await;
    server.set_ack_mode(AckMode::Hold);

    let first = engine.submit(Draft::text(bob(), "still there?")).unwrap();
    let second = engine.submit(Draft::text(bob(), "hello??")).unwrap();
    wait_for_sends(&server, 2).await;

    let report = engine.load_history(&bob(), 1).await.unwrap();
    assert_eq!(report.inserted, 20);

    let timeline = engine.timeline(&bob());
    assert_eq!(timeline.len(), 22);
    assert_eq!(timeline[20].id, MessageId::Provisional(first.provisional_id));
    assert_eq!(timeline[21].id, MessageId::Provisional(second.provisional_id));
    assert_sorted(&engine);

    let again = engine.load_history(&bob(), 1).await.unwrap();
    assert!(!again.changed());
    assert_eq!(engine.timeline(&bob()).len(), 22);

    server.release_acks();
    first.outcome().await.unwrap();
    second.outcome().await.unwrap();
    let timeline = engine.timeline(&bob());
    assert_eq!(timeline.len(), 22);
    assert!(timeline.iter().all(|m| !m.id.is_provisional()));
}

#[tokio::test]
async fn history_record_supersedes_matching_provisional() {
    let api = Arc::new(InMemoryApi::new());
    let (server, engine) = start(Arc::clone(&api)).await;
    server.set_ack_mode(AckMode::Silent);

    let pending = engine.submit(Draft::text(bob(), "deal at 40?")).unwrap();
    wait_for_sends(&server, 1).await;

    let mut stored = record(0, 0);
    stored.id = Some("srv-900".into());
    stored.body = "deal at 40?".into();
    stored.created_at = Timestamp::now();
    api.insert_messages(&bob(), vec![stored]);

    let report = engine.load_history(&bob(), 1).await.unwrap();
    assert_eq!(report.superseded, vec![pending.provisional_id]);
    let timeline = engine.timeline(&bob());
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].id, MessageId::Confirmed("srv-900".into()));
}

#[tokio::test]
async fn older_pages_slot_in_before_newer() {
    let api = Arc::new(InMemoryApi::new());
    let mut records: Vec<WireMessage> = (0..30).map(|n| record(n, 100 - n)).collect();
    records.push(WireMessage {
        id: None,
        ..record(99, 200)
    });
    api.insert_messages(&bob(), records);
    let (_server, engine) = start(api).await;

    engine.load_history(&bob(), 1).await.unwrap();
    let newest_page = engine.timeline(&bob());
    assert_eq!(newest_page.len(), 20);

    engine.load_history(&bob(), 2).await.unwrap();
    let timeline = engine.timeline(&bob());
    assert_eq!(timeline.len(), 30);
    assert_eq!(timeline[0].id, MessageId::Confirmed("h00".into()));
    assert_eq!(timeline[29].id, MessageId::Confirmed("h29".into()));
    assert_sorted(&engine);
}

#[tokio::test]
async fn switching_conversation_discards_previous_timeline() {
    let api = Arc::new(InMemoryApi::new());
    api.insert_messages(&bob(), (0..3).map(|n| record(n, 10 - n)).collect());
    api.set_conversations(vec![WireConversation {
        id: "conv-alice-bob".into(),
        counterpart_id: bob(),
        last_message: Some("history 2".into()),
        last_activity_at: Timestamp::now(),
        unread_count: 0,
    }]);
    let (_server, engine) = start(api).await;

    let conversations = engine.refresh_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);

    engine.select_conversation(&bob()).await.unwrap();
    assert_eq!(engine.timeline(&bob()).len(), 3);

    let carol = UserId::new("carol");
    let conversation = engine.select_conversation(&carol).await.unwrap();
    assert!(conversation.id.is_temporary());
    assert_eq!(engine.active_conversation(), Some(carol));
    assert!(engine.timeline(&bob()).is_empty());
    assert!(
        !engine
            .store()
            .contains(&ConversationKey::between(&alice(), &bob()))
    );
    assert_eq!(engine.conversations().len(), 2);
}

#[tokio::test]
async fn history_failure_surfaces_to_caller() {
    let api = Arc::new(InMemoryApi::new());
    api.set_unavailable(true);
    let (_server, engine) = start(Arc::clone(&api)).await;

    assert!(engine.select_conversation(&bob()).await.is_err());
    assert_eq!(engine.active_conversation(), Some(bob()));

    api.set_unavailable(false);
    api.insert_messages(&bob(), vec![record(1, 1)]);
    engine.load_history(&bob(), 1).await.unwrap();
    assert_eq!(engine.timeline(&bob()).len(), 1);
}

#[tokio::test]
async fn background_pushes_are_released_on_switch() {
    let api = Arc::new(InMemoryApi::new());
    let (server, engine) = start(api).await;
    engine.select_conversation(&bob()).await.unwrap();

    let carol = UserId::new("carol");
    let carol_key = ConversationKey::between(&alice(), &carol);
    server.push(&ServerEvent::NewMessage {
        message: WireMessage {
            id: Some("srv-c1".into()),
            conversation_id: Some("conv-alice-carol".into()),
            sender_id: carol.clone(),
            receiver_id: alice(),
            body: "still for sale?".into(),
            attachment: None,
            created_at: Timestamp::now(),
            is_read: false,
            offer: None,
            client_ref: None,
        },
    });
    tokio::time::timeout(Duration::from_secs(2), async {
        while !engine.store().contains(&carol_key)
            || !engine.conversations().iter().any(|c| c.counterpart == carol)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    server.set_ack_mode(AckMode::Hold);
    let dave = UserId::new("dave");
    let _pending = engine.submit(Draft::text(dave.clone(), "offer stands")).unwrap();

    engine.select_conversation(&UserId::new("erin")).await.unwrap();
    assert!(!engine.store().contains(&carol_key));
    assert!(
        engine
            .store()
            .contains(&ConversationKey::between(&alice(), &dave))
    );
    let preview = engine
        .conversations()
        .into_iter()
        .find(|c| c.counterpart == carol)
        .unwrap();
    assert_eq!(preview.last_message_summary.as_deref(), Some("still for sale?"));
}
