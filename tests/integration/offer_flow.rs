// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::float_cmp
)]

//! Integration tests for offer negotiation events.
//!
//! Validates:
//! - an offer event arriving before its message is parked and replayed
//! - terminal statuses absorb later conflicting events
//! - partial status updates keep fields they do not mention
//! - parked updates expire after the buffer window

use std::sync::Arc;
use std::time::Duration;

use haggle::chat::history::InMemoryApi;
use haggle::chat::media::InMemoryUploader;
use haggle::config::ClientConfig;
use haggle::engine::SyncEngine;
use haggle::transport::Credentials;
use haggle::transport::loopback::{LoopbackConnector, LoopbackServer};
use haggle_proto::event::ServerEvent;
use haggle_proto::message::{Offer, OfferStatus, Timestamp, UserId, WireMessage};

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

fn offer_message(id: &str, order_id: &str, status: OfferStatus) -> WireMessage {
    WireMessage {
        id: Some(id.into()),
        conversation_id: Some("conv-alice-bob".into()),
        sender_id: bob(),
        receiver_id: alice(),
        body: "would you take 40?".into(),
        attachment: None,
        created_at: Timestamp::now(),
        is_read: true,
        offer: Some(Offer {
            order_id: order_id.into(),
            price: Some(40.0),
            description: Some("bike, pickup only".into()),
            status,
        }),
        client_ref: None,
    }
}

async fn start_with(config: ClientConfig, api: Arc<InMemoryApi>) -> (LoopbackServer, Engine) {
    let (server, connector) = LoopbackServer::new();
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

async fn start(api: Arc<InMemoryApi>) -> (LoopbackServer, Engine) {
    start_with(ClientConfig::defaults(), api).await
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn offer_of(engine: &Engine, order_id: &str) -> Option<Offer> {
    engine
        .timeline(&bob())
        .into_iter()
        .filter_map(|m| m.offer)
        .find(|o| o.order_id == order_id)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn early_acceptance_applies_once_history_loads() {
    let api = Arc::new(InMemoryApi::new());
    api.insert_messages(&bob(), vec![offer_message("m1", "O1", OfferStatus::Pending)]);
    let (server, engine) = start(api).await;

    assert!(server.push(&ServerEvent::OfferAccepted {
        order_id: "O1".into(),
        message_id: None,
    }));
    eventually(|| engine.store().parked_offers() == 1).await;

    engine.select_conversation(&bob()).await.unwrap();
    let offer = offer_of(&engine, "O1").unwrap();
    assert_eq!(offer.status, OfferStatus::Accepted);
    assert_eq!(engine.store().parked_offers(), 0);
}

#[tokio::test]
async fn accepted_offer_ignores_later_rejection() {
    let api = Arc::new(InMemoryApi::new());
    api.insert_messages(&bob(), vec![offer_message("m1", "O1", OfferStatus::Pending)]);
    let (server, engine) = start(api).await;
    engine.select_conversation(&bob()).await.unwrap();

    server.push(&ServerEvent::OfferAccepted {
        order_id: "O1".into(),
        message_id: Some("m1".into()),
    });
    eventually(|| offer_of(&engine, "O1").is_some_and(|o| o.status == OfferStatus::Accepted))
        .await;

    server.push(&ServerEvent::OfferRejected {
        order_id: "O1".into(),
        message_id: Some("m1".into()),
    });
    // A stale full-message update must not reopen it either.
    server.push(&ServerEvent::MessageUpdated {
        message: offer_message("m1", "O1", OfferStatus::Pending),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let offer = offer_of(&engine, "O1").unwrap();
    assert_eq!(offer.status, OfferStatus::Accepted);
    assert_eq!(engine.timeline(&bob()).len(), 1);
}

#[tokio::test]
async fn status_update_keeps_known_fields() {
    let api = Arc::new(InMemoryApi::new());
    api.insert_messages(&bob(), vec![offer_message("m1", "O1", OfferStatus::Pending)]);
    let (server, engine) = start(api).await;
    engine.select_conversation(&bob()).await.unwrap();

    server.push(&ServerEvent::OfferStatusUpdated {
        order_id: "O1".into(),
        status: OfferStatus::Pending,
        price: Some(35.0),
        description: None,
    });
    eventually(|| offer_of(&engine, "O1").is_some_and(|o| o.price == Some(35.0))).await;

    let offer = offer_of(&engine, "O1").unwrap();
    assert_eq!(offer.status, OfferStatus::Pending);
    assert_eq!(offer.description.as_deref(), Some("bike, pickup only"));
}

#[tokio::test]
async fn new_offer_push_adds_message() {
    let api = Arc::new(InMemoryApi::new());
    let (server, engine) = start(api).await;
    engine.select_conversation(&bob()).await.unwrap();

    server.push(&ServerEvent::NewOffer {
        message: offer_message("m2", "O2", OfferStatus::Pending),
    });
    eventually(|| offer_of(&engine, "O2").is_some()).await;

    assert_eq!(engine.timeline(&bob()).len(), 1);
    assert_eq!(engine.store().parked_offers(), 0);
}

#[tokio::test]
async fn parked_update_expires() {
    let mut config = ClientConfig::defaults();
    config.offers.window = Duration::from_millis(50);
    let api = Arc::new(InMemoryApi::new());
    api.insert_messages(&bob(), vec![offer_message("m1", "O1", OfferStatus::Pending)]);
    let (server, engine) = start_with(config, api).await;

    server.push(&ServerEvent::OfferRejected {
        order_id: "O1".into(),
        message_id: None,
    });
    eventually(|| engine.store().parked_offers() == 1).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    engine.select_conversation(&bob()).await.unwrap();
    let offer = offer_of(&engine, "O1").unwrap();
    assert_eq!(offer.status, OfferStatus::Pending);
}
