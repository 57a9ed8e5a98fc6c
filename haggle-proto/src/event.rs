//! Socket frame types exchanged with the marketplace backend.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`. The
//! backend announces offer changes under several names (`message_updated`,
//! `new_offer`, `offer_accepted`, `offer_rejected`, `offer_status_updated`);
//! they are kept distinct here and normalized by the client core.

use serde::{Deserialize, Serialize};

use crate::message::{Attachment, OfferStatus, ProvisionalId, UserId, WireMessage};

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Handshake accepted for this user.
    Authenticated {
        /// The authenticated user.
        user_id: UserId,
    },
    /// Handshake rejected (expired or invalid token).
    AuthError {
        /// Server-supplied reason.
        reason: String,
    },
    /// Acknowledgement of a `send_message` frame.
    Ack {
        /// Correlates with [`ClientEvent::SendMessage::ack_id`].
        ack_id: u64,
        /// The confirmed message on success.
        #[serde(default)]
        message: Option<WireMessage>,
        /// Rejection reason on failure.
        #[serde(default)]
        error: Option<String>,
    },
    /// A new message in one of the user's conversations.
    NewMessage {
        /// The message.
        message: WireMessage,
    },
    /// Generic update of an existing message (read flag, offer, ...).
    MessageUpdated {
        /// The updated message.
        message: WireMessage,
    },
    /// A new message carrying an offer.
    NewOffer {
        /// The offer message.
        message: WireMessage,
    },
    /// The offer for `order_id` was accepted.
    OfferAccepted {
        /// Order the offer belongs to.
        order_id: String,
        /// Message carrying the offer, when the backend includes it.
        #[serde(default)]
        message_id: Option<String>,
    },
    /// The offer for `order_id` was rejected.
    OfferRejected {
        /// Order the offer belongs to.
        order_id: String,
        /// Message carrying the offer, when the backend includes it.
        #[serde(default)]
        message_id: Option<String>,
    },
    /// Explicit status change for `order_id`.
    OfferStatusUpdated {
        /// Order the offer belongs to.
        order_id: String,
        /// New status.
        status: OfferStatus,
        /// Updated price, if changed.
        #[serde(default)]
        price: Option<f64>,
        /// Updated description, if changed.
        #[serde(default)]
        description: Option<String>,
    },
    /// The conversation list should be refetched.
    ConversationsChanged,
    /// A user started or stopped typing to another user.
    TypingChanged {
        /// Who is typing.
        user_id: UserId,
        /// Who they are typing to.
        counterpart_id: UserId,
        /// Current state.
        is_typing: bool,
    },
    /// Full set of currently online users.
    PresenceSnapshot {
        /// Online user ids.
        online: Vec<UserId>,
    },
    /// One user's presence changed.
    PresenceChanged {
        /// The user.
        user_id: UserId,
        /// New state.
        online: bool,
    },
}

impl ServerEvent {
    /// Wire name of this event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::AuthError { .. } => "auth_error",
            Self::Ack { .. } => "ack",
            Self::NewMessage { .. } => "new_message",
            Self::MessageUpdated { .. } => "message_updated",
            Self::NewOffer { .. } => "new_offer",
            Self::OfferAccepted { .. } => "offer_accepted",
            Self::OfferRejected { .. } => "offer_rejected",
            Self::OfferStatusUpdated { .. } => "offer_status_updated",
            Self::ConversationsChanged => "conversations_changed",
            Self::TypingChanged { .. } => "typing_changed",
            Self::PresenceSnapshot { .. } => "presence_snapshot",
            Self::PresenceChanged { .. } => "presence_changed",
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Send a message; the server answers with [`ServerEvent::Ack`].
    SendMessage {
        /// Correlation id for the acknowledgement.
        ack_id: u64,
        /// Recipient.
        receiver_id: UserId,
        /// Text body.
        body: String,
        /// Uploaded attachment reference.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
        /// Provisional id the server echoes back on the confirmed message.
        client_ref: ProvisionalId,
    },
    /// Local typing state towards `counterpart_id`.
    Typing {
        /// Recipient of the indicator.
        counterpart_id: UserId,
        /// Current state.
        is_typing: bool,
    },
    /// Ask for a fresh [`ServerEvent::PresenceSnapshot`].
    RequestPresence,
}

impl ClientEvent {
    /// Wire name of this event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::RequestPresence => "request_presence",
        }
    }
}
