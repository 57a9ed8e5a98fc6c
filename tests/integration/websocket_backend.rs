// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::needless_pass_by_value
)]

//! Integration tests against a real WebSocket and HTTP backend.
//!
//! An in-process axum server stands in for the marketplace backend:
//! - `GET /socket` upgrades to the chat socket after checking the bearer token
//! - `GET /api/conversations`, `GET /api/messages/{id}`,
//!   `POST /api/conversations/{id}/read` and `POST /api/media` serve REST
//!
//! Validates the bearer handshake, acknowledged sends over the wire, the
//! REST client's routes and error mapping, and multipart uploads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use haggle::chat::history::{HistoryError, HttpRestClient, RestApi};
use haggle::chat::media::{HttpMediaUploader, MediaUploader, OutgoingAttachment};
use haggle::chat::send::Draft;
use haggle::config::ClientConfig;
use haggle::engine::{EngineError, SyncEngine};
use haggle::transport::websocket::WebSocketConnector;
use haggle::transport::{Connector, Credentials, Link, TransportError};
use haggle_proto::codec;
use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::{MessageId, Timestamp, UserId, WireConversation, WireMessage};

const TOKEN: &str = "secret-token";

// =============================================================================
// Fake backend
// =============================================================================

#[derive(Default)]
struct Backend {
    history: parking_lot::Mutex<Vec<WireMessage>>,
    queries: parking_lot::Mutex<Vec<HashMap<String, String>>>,
    read_marks: parking_lot::Mutex<Vec<String>>,
    uploads: parking_lot::Mutex<Vec<String>>,
    frames: parking_lot::Mutex<Vec<ClientEvent>>,
}

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(backend): State<Arc<Backend>>,
) -> Response {
    if headers.get(header::AUTHORIZATION).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let accepted = authorized(&headers);
    ws.on_upgrade(move |socket| serve_socket(socket, accepted, backend))
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    let text = codec::encode_server(event).unwrap();
    socket.send(Message::Text(text.into())).await.is_ok()
}

async fn serve_socket(mut socket: WebSocket, accepted: bool, backend: Arc<Backend>) {
    let verdict = if accepted {
        ServerEvent::Authenticated { user_id: alice() }
    } else {
        ServerEvent::AuthError {
            reason: "invalid token".into(),
        }
    };
    if !send_event(&mut socket, &verdict).await || !accepted {
        return;
    }

    while let Some(Ok(frame)) = socket.recv().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(event) = codec::decode_client(text.as_str()) else {
            continue;
        };
        backend.frames.lock().push(event.clone());
        let reply = match event {
            ClientEvent::SendMessage {
                ack_id,
                receiver_id,
                body,
                attachment,
                client_ref,
            } => ServerEvent::Ack {
                ack_id,
                message: Some(WireMessage {
                    id: Some(format!("srv-{ack_id}")),
                    conversation_id: Some("conv-alice-bob".into()),
                    sender_id: alice(),
                    receiver_id,
                    body,
                    attachment,
                    created_at: Timestamp::now(),
                    is_read: false,
                    offer: None,
                    client_ref: Some(client_ref),
                }),
                error: None,
            },
            ClientEvent::RequestPresence => ServerEvent::PresenceSnapshot {
                online: vec![bob()],
            },
            ClientEvent::Typing { .. } => continue,
        };
        if !send_event(&mut socket, &reply).await {
            break;
        }
    }
}

async fn conversations(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(vec![WireConversation {
        id: "conv-alice-bob".into(),
        counterpart_id: bob(),
        last_message: Some("see you at 5".into()),
        last_activity_at: Timestamp::now(),
        unread_count: 2,
    }])
    .into_response()
}

async fn messages(
    headers: HeaderMap,
    Path(counterpart): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(backend): State<Arc<Backend>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if counterpart != "bob" {
        return StatusCode::NOT_FOUND.into_response();
    }
    backend.queries.lock().push(query);
    Json(backend.history.lock().clone()).into_response()
}

async fn mark_read(
    headers: HeaderMap,
    Path(counterpart): Path<String>,
    State(backend): State<Arc<Backend>>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    backend.read_marks.lock().push(counterpart);
    StatusCode::NO_CONTENT
}

async fn upload(
    headers: HeaderMap,
    State(backend): State<Arc<Backend>>,
    body: axum::body::Bytes,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));
    if !is_multipart {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let text = String::from_utf8_lossy(&body);
    if !text.contains("filename=\"bike.jpg\"") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    backend.uploads.lock().push("bike.jpg".into());
    Json(serde_json::json!({ "url": "https://cdn.test/bike.jpg" })).into_response()
}

async fn start_backend() -> (SocketAddr, Arc<Backend>) {
    let backend = Arc::new(Backend::default());
    let app = Router::new()
        .route("/socket", get(socket_handler))
        .route("/api/conversations", get(conversations))
        .route("/api/messages/{counterpart}", get(messages))
        .route("/api/conversations/{counterpart}/read", post(mark_read))
        .route("/api/media", post(upload))
        .with_state(Arc::clone(&backend));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, backend)
}

fn history_record(id: &str, minutes_ago: u64) -> WireMessage {
    WireMessage {
        id: Some(id.into()),
        conversation_id: Some("conv-alice-bob".into()),
        sender_id: bob(),
        receiver_id: alice(),
        body: format!("history {id}"),
        attachment: None,
        created_at: Timestamp::from_millis(Timestamp::now().as_millis() - minutes_ago * 60_000),
        is_read: false,
        offer: None,
        client_ref: None,
    }
}

fn rest_client(addr: SocketAddr, token: &str) -> HttpRestClient {
    HttpRestClient::new(&format!("http://{addr}/api"), token, Duration::from_secs(5)).unwrap()
}

// =============================================================================
// Socket
// =============================================================================

#[tokio::test]
async fn bearer_token_is_sent_on_upgrade() {
    let (addr, _backend) = start_backend().await;
    let connector = WebSocketConnector::new(&format!("ws://{addr}/socket")).unwrap();

    let link = connector
        .open(&Credentials::new(alice(), TOKEN))
        .await
        .unwrap();
    let first = codec::decode_server(&link.recv_text().await.unwrap()).unwrap();
    assert!(matches!(first, ServerEvent::Authenticated { user_id } if user_id == alice()));
    link.close().await;
}

#[tokio::test]
async fn wrong_token_fails_engine_start() {
    let (addr, _backend) = start_backend().await;
    let result = SyncEngine::start(
        &ClientConfig::defaults(),
        WebSocketConnector::new(&format!("ws://{addr}/socket")).unwrap(),
        rest_client(addr, "wrong"),
        HttpMediaUploader::new(&format!("http://{addr}/api"), "wrong", Duration::from_secs(5))
            .unwrap(),
        Credentials::new(alice(), "wrong"),
    )
    .await;
    assert!(matches!(
        result,
        Err(EngineError::Transport(TransportError::Auth(_)))
    ));
}

#[tokio::test]
async fn engine_round_trip_over_the_wire() {
    let (addr, backend) = start_backend().await;
    backend
        .history
        .lock()
        .extend([history_record("h1", 30), history_record("h2", 20)]);
    let api_url = format!("http://{addr}/api");

    let engine = SyncEngine::start(
        &ClientConfig::defaults(),
        WebSocketConnector::new(&format!("ws://{addr}/socket")).unwrap(),
        rest_client(addr, TOKEN),
        HttpMediaUploader::new(&api_url, TOKEN, Duration::from_secs(5)).unwrap(),
        Credentials::new(alice(), TOKEN),
    )
    .await
    .unwrap();

    let conversations = engine.refresh_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].unread_count, 2);

    engine.select_conversation(&bob()).await.unwrap();
    assert_eq!(engine.timeline(&bob()).len(), 2);

    let draft = Draft {
        counterpart: bob(),
        body: "here it is".into(),
        attachment: Some(OutgoingAttachment::new("bike.jpg", "image/jpeg", vec![7; 32])),
    };
    let receipt = engine.send(draft).await.unwrap();
    assert!(matches!(receipt.message.id, MessageId::Confirmed(_)));
    assert_eq!(
        receipt.message.attachment.unwrap().url,
        "https://cdn.test/bike.jpg"
    );
    assert_eq!(engine.timeline(&bob()).len(), 3);
    assert_eq!(*backend.uploads.lock(), vec!["bike.jpg".to_string()]);

    assert_eq!(engine.mark_read(&bob()).await.unwrap(), 2);
    assert_eq!(*backend.read_marks.lock(), vec!["bob".to_string()]);

    tokio::time::timeout(Duration::from_secs(2), async {
        while !engine.presence().is_online(&bob()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(
        backend
            .frames
            .lock()
            .iter()
            .any(|f| *f == ClientEvent::RequestPresence)
    );

    engine.shutdown().await;
}

// =============================================================================
// REST
// =============================================================================

#[tokio::test]
async fn history_request_carries_page_and_limit() {
    let (addr, backend) = start_backend().await;
    backend.history.lock().push(history_record("h1", 5));
    let client = rest_client(addr, TOKEN);

    let page = client.fetch_messages(&bob(), 3, 50).await.unwrap();
    assert_eq!(page.len(), 1);

    let queries = backend.queries.lock();
    assert_eq!(queries[0].get("page").map(String::as_str), Some("3"));
    assert_eq!(queries[0].get("limit").map(String::as_str), Some("50"));
}

#[tokio::test]
async fn rest_errors_are_mapped() {
    let (addr, _backend) = start_backend().await;

    let unknown = rest_client(addr, TOKEN)
        .fetch_messages(&UserId::new("nobody"), 1, 20)
        .await;
    assert!(matches!(unknown, Err(HistoryError::NotFound)));

    let unauthorized = rest_client(addr, "wrong").list_conversations().await;
    assert!(matches!(
        unauthorized,
        Err(HistoryError::Server { status: 401 })
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);
    let offline = rest_client(closed, TOKEN).list_conversations().await;
    assert!(matches!(offline, Err(HistoryError::Network(_))));
}

#[tokio::test]
async fn upload_sends_multipart_file() {
    let (addr, backend) = start_backend().await;
    let uploader =
        HttpMediaUploader::new(&format!("http://{addr}/api"), TOKEN, Duration::from_secs(5))
            .unwrap();

    let attachment = uploader
        .upload(&OutgoingAttachment::new("bike.jpg", "image/jpeg", vec![1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(attachment.url, "https://cdn.test/bike.jpg");
    assert!(!attachment.pending);
    assert_eq!(backend.uploads.lock().len(), 1);
}
