// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Integration tests for the socket lifecycle as seen through the engine.
//!
//! Validates:
//! - a rejected token fails start-up and leaves no retry loop behind
//! - a dropped link is re-established and the engine keeps working
//! - in-flight sends fail and roll back when the link drops
//! - a mid-session `auth_error` ends in `NeedsLogin`
//! - shutdown closes the socket

use std::sync::Arc;
use std::time::Duration;

use haggle::chat::history::InMemoryApi;
use haggle::chat::media::InMemoryUploader;
use haggle::chat::send::{Draft, SendError};
use haggle::config::ClientConfig;
use haggle::engine::{EngineError, SyncEngine};
use haggle::transport::loopback::{AckMode, AuthMode, LoopbackConnector, LoopbackServer};
use haggle::transport::{ConnectionState, Credentials, TransportError};
use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::{Timestamp, UserId, WireMessage};

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

fn config() -> ClientConfig {
    let mut config = ClientConfig::defaults();
    config.transport.reconnect.initial_delay = Duration::from_millis(10);
    config.transport.reconnect.max_delay = Duration::from_millis(40);
    config.transport.reconnect.max_attempts = 3;
    config.send.ack_timeout = Duration::from_secs(2);
    config
}

async fn start(connector: LoopbackConnector) -> Result<Engine, EngineError> {
    SyncEngine::start(
        &config(),
        connector,
        Arc::new(InMemoryApi::new()),
        Arc::new(InMemoryUploader::new()),
        Credentials::new(alice(), "token-a"),
    )
    .await
}

async fn wait_for_state(engine: &Engine, wanted: ConnectionState) {
    let mut state = engine.connection().watch_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .unwrap();
}

fn incoming(id: &str) -> ServerEvent {
    ServerEvent::NewMessage {
        message: WireMessage {
            id: Some(id.into()),
            conversation_id: Some("conv-alice-bob".into()),
            sender_id: bob(),
            receiver_id: alice(),
            body: format!("message {id}"),
            attachment: None,
            created_at: Timestamp::now(),
            is_read: false,
            offer: None,
            client_ref: None,
        },
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn rejected_token_fails_start() {
    let (server, connector) = LoopbackServer::new();
    server.expect_token("token-b");

    let err = start(connector).await.unwrap_err();
    assert!(matches!(err, EngineError::Transport(TransportError::Auth(_))));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn unreachable_server_fails_start() {
    let (server, connector) = LoopbackServer::new();
    server.refuse_connections(true);

    let err = start(connector).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transport(TransportError::Network(_))
    ));
}

#[tokio::test]
async fn engine_survives_a_dropped_link() {
    let (server, connector) = LoopbackServer::new();
    let engine = start(connector).await.unwrap();

    server.push(&incoming("srv-101"));
    server.drop_connection();
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.connection_count() < 2 || !engine.connection().is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    server.push(&incoming("srv-102"));
    let receipt = engine.send(Draft::text(bob(), "back online")).await.unwrap();
    assert!(!receipt.message.id.is_provisional());

    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.timeline(&bob()).len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let presence_requests = server
        .received()
        .into_iter()
        .filter(|f| *f == ClientEvent::RequestPresence)
        .count();
    assert_eq!(presence_requests, 2);
}

#[tokio::test]
async fn in_flight_send_fails_when_link_drops() {
    let (server, connector) = LoopbackServer::new();
    let engine = start(connector).await.unwrap();
    server.set_ack_mode(AckMode::Hold);

    let pending = engine.submit(Draft::text(bob(), "are you there")).unwrap();
    loop {
        if matches!(server.next_frame().await, Some(ClientEvent::SendMessage { .. })) {
            break;
        }
    }
    server.drop_connection();

    let failure = pending.outcome().await.unwrap_err();
    assert!(matches!(failure.error, SendError::ConnectionLost));
    assert_eq!(failure.draft.body, "are you there");
    assert!(engine.timeline(&bob()).is_empty());
}

#[tokio::test]
async fn revoked_session_needs_login() {
    let (server, connector) = LoopbackServer::new();
    let engine = start(connector).await.unwrap();

    server.push(&ServerEvent::AuthError {
        reason: "session revoked".into(),
    });
    wait_for_state(&engine, ConnectionState::NeedsLogin).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 1);
    let failure = engine.submit(Draft::text(bob(), "hello")).unwrap_err();
    assert!(matches!(failure.error, SendError::NotConnected));
}

#[tokio::test]
async fn failed_reconnect_with_rejected_token_needs_login() {
    let (server, connector) = LoopbackServer::new();
    let engine = start(connector).await.unwrap();

    server.set_auth(AuthMode::Reject("token expired".into()));
    server.drop_connection();
    wait_for_state(&engine, ConnectionState::NeedsLogin).await;
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn shutdown_closes_the_socket() {
    let (server, connector) = LoopbackServer::new();
    let engine = start(connector).await.unwrap();
    assert!(server.is_connected());

    let connection = engine.connection().clone();
    engine.shutdown().await;
    assert!(!connection.is_connected());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
