//! Transport layer for the marketplace socket.
//!
//! Defines the [`Link`] / [`Connector`] traits that carry JSON text frames,
//! the connection-level event and state types, and the
//! [`manager::ConnectionManager`] that owns the one live connection.
//! Concrete links:
//! - [`websocket::WebSocketConnector`]: tokio-tungstenite client
//! - [`loopback::LoopbackConnector`]: in-process fake backend for tests

pub mod loopback;
pub mod manager;
pub mod websocket;

use std::fmt;

use haggle_proto::codec::CodecError;
use haggle_proto::event::{ClientEvent, ServerEvent};
use haggle_proto::message::UserId;

pub use manager::{Connection, ConnectionManager};

/// Login credentials carried in the socket handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user_id: UserId,
    token: String,
}

impl Credentials {
    /// Bundles a user id with its bearer token.
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }

    /// The user the token belongs to.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server rejected the credentials. Terminal until a new login.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network-level failure. Transient.
    #[error("network error: {0}")]
    Network(String),

    /// The handshake did not follow the protocol.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The link was closed by the other side.
    #[error("connection closed")]
    ConnectionClosed,

    /// No live link; outbound actions fail fast instead of queueing.
    #[error("not connected")]
    NotConnected,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// The socket URL is unusable.
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// Whether retrying can help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::InvalidUrl(_))
    }
}

/// Errors from a send that expects an acknowledgement.
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    /// No acknowledgement within the bounded wait.
    #[error("acknowledgement timed out")]
    Timeout,

    /// The server answered with a negative acknowledgement.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The link went down while waiting.
    #[error("connection lost before acknowledgement")]
    ConnectionLost,

    /// Nothing was sent.
    #[error("not sent: {0}")]
    NotSent(#[from] TransportError),
}

/// Lifecycle state of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link, not trying.
    Disconnected,
    /// Opening the first link.
    Connecting,
    /// Authenticated and live.
    Connected,
    /// Link dropped; retry `attempt` of the bounded policy is in progress.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
    },
    /// Credentials were rejected; a new login is required.
    NeedsLogin,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::NeedsLogin => write!(f, "disconnected, needs login"),
        }
    }
}

/// Why a link went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The server closed the link.
    ServerClosed,
    /// Read or write failure.
    Network(String),
    /// The server revoked the session mid-stream.
    AuthRevoked(String),
    /// The bounded reconnect policy ran out of attempts.
    RetriesExhausted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::ServerClosed => write!(f, "closed by server"),
            Self::Network(reason) => write!(f, "network: {reason}"),
            Self::AuthRevoked(reason) => write!(f, "auth revoked: {reason}"),
            Self::RetriesExhausted => write!(f, "reconnect attempts exhausted"),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A link was established and authenticated.
    Connected,
    /// The link went away.
    Disconnected(DisconnectReason),
    /// A connection attempt failed.
    ConnectError(String),
}

/// Everything published to transport subscribers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Lifecycle notification.
    Connection(ConnectionEvent),
    /// A decoded server push.
    Server(ServerEvent),
}

/// A single authenticated-or-not text-frame link.
///
/// Implementations carry opaque JSON text; framing semantics (handshake,
/// acks, dispatch) live in the manager.
pub trait Link: Send + Sync + 'static {
    /// Send one text frame.
    fn send_text(
        &self,
        text: String,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next text frame.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the peer is gone.
    fn recv_text(&self) -> impl std::future::Future<Output = Result<String, TransportError>> + Send;

    /// Close the link. Idempotent.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Opens links, carrying credentials in the handshake.
pub trait Connector: Send + Sync + 'static {
    /// The link type produced.
    type Link: Link;

    /// Open a new link authenticated with `credentials`.
    fn open(
        &self,
        credentials: &Credentials,
    ) -> impl std::future::Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// Fire-and-forget outbound entry point.
pub trait Emitter: Send + Sync + 'static {
    /// Queue `event` for sending.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when there is no live link.
    fn emit(&self, event: ClientEvent) -> Result<(), TransportError>;
}
