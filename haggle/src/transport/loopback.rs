//! In-process fake marketplace backend.
//!
//! [`LoopbackServer`] plays the server side of the socket protocol without
//! any networking: it authenticates handshakes, acknowledges sends, answers
//! presence requests, and lets tests push arbitrary frames or drop the link.
//! [`LoopbackConnector`] is the matching [`Connector`] handed to a
//! [`ConnectionManager`](super::ConnectionManager).

use std::sync::Arc;

use tokio::sync::mpsc;

use haggle_proto::codec;
use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::{Attachment, ProvisionalId, Timestamp, UserId, WireMessage};

use super::{Connector, Credentials, Link, TransportError};

/// How the fake server answers handshakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Accept any token (or the expected one, if set).
    Accept,
    /// Answer every handshake with `auth_error`.
    Reject(String),
}

/// How the fake server answers `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge with the confirmed message.
    Confirm,
    /// Push `new_message` first, then acknowledge.
    PushThenConfirm,
    /// Acknowledge first, then push `new_message`.
    ConfirmThenPush,
    /// Negative acknowledgement.
    Reject(String),
    /// Hold acknowledgements until [`LoopbackServer::release_acks`].
    Hold,
    /// Never acknowledge.
    Silent,
}

struct Session {
    id: u64,
    to_client: mpsc::UnboundedSender<String>,
}

struct BackendState {
    auth: AuthMode,
    expected_token: Option<String>,
    refuse: bool,
    ack_mode: AckMode,
    session: Option<Session>,
    session_user: Option<UserId>,
    next_session: u64,
    connections: u32,
    next_message: u64,
    clock: Option<Timestamp>,
    online: Vec<UserId>,
    received: Vec<ClientEvent>,
    held: Vec<(u64, WireMessage)>,
}

impl BackendState {
    fn send(&self, event: &ServerEvent) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        match codec::encode_server(event) {
            Ok(text) => session.to_client.send(text).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "loopback failed to encode frame");
                false
            }
        }
    }

    fn confirm(
        &mut self,
        receiver_id: UserId,
        body: String,
        attachment: Option<Attachment>,
        client_ref: ProvisionalId,
    ) -> Option<WireMessage> {
        let sender_id = self.session_user.clone()?;
        self.next_message += 1;
        let created_at = self.clock.unwrap_or_else(Timestamp::now);
        let conversation_id = if sender_id <= receiver_id {
            format!("conv-{sender_id}-{receiver_id}")
        } else {
            format!("conv-{receiver_id}-{sender_id}")
        };
        Some(WireMessage {
            id: Some(format!("srv-{}", self.next_message)),
            conversation_id: Some(conversation_id),
            sender_id,
            receiver_id,
            body,
            attachment,
            created_at,
            is_read: false,
            offer: None,
            client_ref: Some(client_ref),
        })
    }

    fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::SendMessage {
                ack_id,
                receiver_id,
                body,
                attachment,
                client_ref,
            } => {
                if let AckMode::Reject(reason) = &self.ack_mode {
                    let nack = ServerEvent::Ack {
                        ack_id,
                        message: None,
                        error: Some(reason.clone()),
                    };
                    self.send(&nack);
                    return;
                }
                let Some(message) = self.confirm(receiver_id, body, attachment, client_ref) else {
                    return;
                };
                let ack = ServerEvent::Ack {
                    ack_id,
                    message: Some(message.clone()),
                    error: None,
                };
                let push = ServerEvent::NewMessage {
                    message: message.clone(),
                };
                match self.ack_mode {
                    AckMode::Confirm => {
                        self.send(&ack);
                    }
                    AckMode::PushThenConfirm => {
                        self.send(&push);
                        self.send(&ack);
                    }
                    AckMode::ConfirmThenPush => {
                        self.send(&ack);
                        self.send(&push);
                    }
                    AckMode::Hold => self.held.push((ack_id, message)),
                    AckMode::Silent | AckMode::Reject(_) => {}
                }
            }
            ClientEvent::RequestPresence => {
                let snapshot = ServerEvent::PresenceSnapshot {
                    online: self.online.clone(),
                };
                self.send(&snapshot);
            }
            ClientEvent::Typing { .. } => {}
        }
    }
}

struct Backend {
    state: parking_lot::Mutex<BackendState>,
    frames_tx: mpsc::UnboundedSender<ClientEvent>,
    frames_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
}

fn open_session(
    backend: &Arc<Backend>,
    credentials: &Credentials,
) -> Result<LoopbackLink, TransportError> {
    let mut state = backend.state.lock();
    state.connections += 1;
    if state.refuse {
        return Err(TransportError::Network("connection refused".into()));
    }

    let (to_client, incoming) = mpsc::unbounded_channel();
    state.next_session += 1;
    let id = state.next_session;
    state.session = Some(Session { id, to_client });
    state.session_user = Some(credentials.user_id().clone());

    let verdict = match (&state.auth, &state.expected_token) {
        (AuthMode::Reject(reason), _) => ServerEvent::AuthError {
            reason: reason.clone(),
        },
        (AuthMode::Accept, Some(expected)) if expected != credentials.token() => {
            ServerEvent::AuthError {
                reason: "invalid token".into(),
            }
        }
        (AuthMode::Accept, _) => ServerEvent::Authenticated {
            user_id: credentials.user_id().clone(),
        },
    };
    state.send(&verdict);

    Ok(LoopbackLink {
        backend: Arc::clone(backend),
        session: id,
        incoming: tokio::sync::Mutex::new(incoming),
    })
}

/// Test-side handle of the fake backend.
#[derive(Clone)]
pub struct LoopbackServer {
    backend: Arc<Backend>,
}

impl LoopbackServer {
    /// Creates a fake backend and the connector that dials it.
    #[must_use]
    pub fn new() -> (Self, LoopbackConnector) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Backend {
            state: parking_lot::Mutex::new(BackendState {
                auth: AuthMode::Accept,
                expected_token: None,
                refuse: false,
                ack_mode: AckMode::Confirm,
                session: None,
                session_user: None,
                next_session: 0,
                connections: 0,
                next_message: 0,
                clock: None,
                online: Vec::new(),
                received: Vec::new(),
                held: Vec::new(),
            }),
            frames_tx,
            frames_rx: tokio::sync::Mutex::new(frames_rx),
        });
        (
            Self {
                backend: Arc::clone(&backend),
            },
            LoopbackConnector { backend },
        )
    }

    /// Sets how future handshakes are answered.
    pub fn set_auth(&self, mode: AuthMode) {
        self.backend.state.lock().auth = mode;
    }

    /// Only accept this token from now on.
    pub fn expect_token(&self, token: impl Into<String>) {
        self.backend.state.lock().expected_token = Some(token.into());
    }

    /// Refuse (or stop refusing) new connections at the network level.
    pub fn refuse_connections(&self, refuse: bool) {
        self.backend.state.lock().refuse = refuse;
    }

    /// Sets how `send_message` frames are answered.
    pub fn set_ack_mode(&self, mode: AckMode) {
        self.backend.state.lock().ack_mode = mode;
    }

    /// Pins `createdAt` of confirmed messages instead of using the wall clock.
    pub fn set_clock(&self, at: Timestamp) {
        self.backend.state.lock().clock = Some(at);
    }

    /// Users reported by the next presence snapshot.
    pub fn set_online(&self, online: Vec<UserId>) {
        self.backend.state.lock().online = online;
    }

    /// Push a frame to the connected client. Returns `false` if none is connected.
    pub fn push(&self, event: &ServerEvent) -> bool {
        self.backend.state.lock().send(event)
    }

    /// Push raw text, bypassing the codec.
    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        let state = self.backend.state.lock();
        state
            .session
            .as_ref()
            .is_some_and(|session| session.to_client.send(text.into()).is_ok())
    }

    /// Send every held acknowledgement, oldest first.
    pub fn release_acks(&self) {
        let mut state = self.backend.state.lock();
        let held = std::mem::take(&mut state.held);
        for (ack_id, message) in held {
            state.send(&ServerEvent::Ack {
                ack_id,
                message: Some(message),
                error: None,
            });
        }
    }

    /// Drop the current link, as if the network went away.
    pub fn drop_connection(&self) {
        self.backend.state.lock().session = None;
    }

    /// Whether a client link is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.backend.state.lock().session.is_some()
    }

    /// Number of connection attempts seen so far, refused ones included.
    #[must_use]
    pub fn connection_count(&self) -> u32 {
        self.backend.state.lock().connections
    }

    /// Every client frame received so far.
    #[must_use]
    pub fn received(&self) -> Vec<ClientEvent> {
        self.backend.state.lock().received.clone()
    }

    /// Wait for the next client frame.
    pub async fn next_frame(&self) -> Option<ClientEvent> {
        self.backend.frames_rx.lock().await.recv().await
    }
}

/// Dials a [`LoopbackServer`].
pub struct LoopbackConnector {
    backend: Arc<Backend>,
}

impl Connector for LoopbackConnector {
    type Link = LoopbackLink;

    async fn open(&self, credentials: &Credentials) -> Result<Self::Link, TransportError> {
        open_session(&self.backend, credentials)
    }
}

/// Client side of one loopback session.
pub struct LoopbackLink {
    backend: Arc<Backend>,
    session: u64,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Link for LoopbackLink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut state = self.backend.state.lock();
        if state.session.as_ref().map(|s| s.id) != Some(self.session) {
            return Err(TransportError::ConnectionClosed);
        }
        let event = match codec::decode_client(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "loopback ignoring malformed client frame");
                return Ok(());
            }
        };
        state.received.push(event.clone());
        let _ = self.backend.frames_tx.send(event.clone());
        state.handle(event);
        Ok(())
    }

    async fn recv_text(&self) -> Result<String, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        let mut state = self.backend.state.lock();
        if state.session.as_ref().map(|s| s.id) == Some(self.session) {
            state.session = None;
        }
    }
}
