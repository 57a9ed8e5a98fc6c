//! Message, offer and identity types shared by the socket and REST formats.
//!
//! Wire records (`Wire*`) mirror what the backend sends: ids are optional and
//! timestamps may be ISO strings. Domain records ([`Message`]) are what the
//! client core works with: every message has a [`MessageId`] that is either
//! provisional (created locally, not yet acknowledged) or confirmed.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Reserved prefix marking a provisional id on the wire.
pub const PROVISIONAL_PREFIX: &str = "tmp-";

/// Maximum allowed message body size in bytes (64 KB).
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Identifies a marketplace user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a two-party conversation: the unordered pair of participants.
///
/// Stored normalized so `between(a, b) == between(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    /// Builds the key for the conversation between `a` and `b`.
    #[must_use]
    pub fn between(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            Self {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }

    /// Whether `user` is one of the two participants.
    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        self.low == *user || self.high == *user
    }

    /// Returns the participant that is not `me`.
    ///
    /// For a self-conversation both participants are `me`.
    #[must_use]
    pub fn other(&self, me: &UserId) -> &UserId {
        if self.low == *me { &self.high } else { &self.low }
    }

    /// Both participants, in normalized order.
    #[must_use]
    pub const fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// Locally generated id for a message the server has not acknowledged yet.
///
/// Rendered on the wire as `tmp-<uuid>` so the server can echo it back as a
/// `clientRef` on the confirmed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProvisionalId(Uuid);

impl ProvisionalId {
    /// Creates a fresh, time-ordered provisional id (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a provisional id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses the wire form (`tmp-<uuid>`). Returns `None` without the prefix.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(PROVISIONAL_PREFIX)?;
        Uuid::parse_str(rest).ok().map(Self)
    }
}

impl Default for ProvisionalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PROVISIONAL_PREFIX}{}", self.0)
    }
}

impl TryFrom<String> for ProvisionalId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("not a provisional id: {value}"))
    }
}

impl From<ProvisionalId> for String {
    fn from(id: ProvisionalId) -> Self {
        id.to_string()
    }
}

/// Identity of a message inside a timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Created locally, awaiting acknowledgement.
    Provisional(ProvisionalId),
    /// Issued by the server; durable.
    Confirmed(String),
}

impl MessageId {
    /// Classifies a raw wire id by its prefix.
    ///
    /// Only used at the wire boundary; inside the core the variant is the
    /// discriminant.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        ProvisionalId::parse(raw).map_or_else(|| Self::Confirmed(raw.to_string()), Self::Provisional)
    }

    /// Returns `true` for locally generated ids.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    /// Returns the server id, if confirmed.
    #[must_use]
    pub fn as_confirmed(&self) -> Option<&str> {
        match self {
            Self::Confirmed(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }

    /// Returns the provisional id, if not yet confirmed.
    #[must_use]
    pub const fn as_provisional(&self) -> Option<ProvisionalId> {
        match self {
            Self::Provisional(id) => Some(*id),
            Self::Confirmed(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => write!(f, "{id}"),
            Self::Confirmed(id) => f.write_str(id),
        }
    }
}

/// Millisecond-precision UTC timestamp.
///
/// Serialized as integer milliseconds. Deserializes from either integer
/// milliseconds or an RFC 3339 string, since REST history uses ISO dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Parses an RFC 3339 date (`2024-05-01T10:00:00.000Z`).
    #[must_use]
    pub fn parse_rfc3339(raw: &str) -> Option<Self> {
        let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
        u64::try_from(parsed.timestamp_millis()).ok().map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Self(ms)),
            Raw::Text(text) => Self::parse_rfc3339(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {text}"))),
        }
    }
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Still image.
    Image,
    /// Video clip.
    Video,
    /// Any other file.
    #[serde(other)]
    File,
}

/// Media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Remote URL, or a local preview reference while the upload is pending.
    pub url: String,
    /// Media kind.
    pub kind: AttachmentKind,
    /// `true` until the upload has completed.
    #[serde(default)]
    pub pending: bool,
}

/// Outcome of applying a status change to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status moved forward.
    Applied,
    /// The offer already had this status.
    Unchanged,
    /// The offer is terminal and the change conflicts; nothing happened.
    Ignored,
}

/// Negotiation status of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum OfferStatus {
    /// Awaiting the counterpart's decision.
    Pending,
    /// Accepted by the counterpart. Terminal.
    Accepted,
    /// Rejected by the counterpart. Terminal.
    Rejected,
}

impl OfferStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }

    /// Decides whether `self` may move to `next`.
    ///
    /// Pending may become anything; terminal states absorb every later
    /// change, so re-delivered or out-of-order events are harmless.
    #[must_use]
    pub fn transition(self, next: Self) -> Transition {
        if self == next {
            Transition::Unchanged
        } else if self.is_terminal() {
            Transition::Ignored
        } else {
            Transition::Applied
        }
    }

    /// Parses the status spellings the backend uses (case-insensitive).
    #[must_use]
    pub fn parse_loose(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "open" => Some(Self::Pending),
            "accepted" | "accept" => Some(Self::Accepted),
            "rejected" | "reject" | "declined" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl TryFrom<String> for OfferStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_loose(&value).ok_or_else(|| format!("unknown offer status: {value}"))
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

fn default_offer_status() -> OfferStatus {
    OfferStatus::Pending
}

/// A price proposal embedded in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    /// Order the offer negotiates. Stable across status changes.
    pub order_id: String,
    /// Proposed price, if known locally.
    #[serde(default)]
    pub price: Option<f64>,
    /// Free-form description, if known locally.
    #[serde(default)]
    pub description: Option<String>,
    /// Negotiation status.
    #[serde(default = "default_offer_status")]
    pub status: OfferStatus,
}

/// A message as the backend sends it over REST or the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Server id. Records without one are malformed.
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    /// Server conversation id, when the backend already assigned one.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
    /// Text body (may be empty for attachment-only messages).
    #[serde(default)]
    pub body: String,
    /// Attached media.
    #[serde(default)]
    pub attachment: Option<Attachment>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Read flag as seen by the receiver.
    #[serde(default)]
    pub is_read: bool,
    /// Embedded offer.
    #[serde(default)]
    pub offer: Option<Offer>,
    /// Provisional id of the local send this message confirms, if any.
    #[serde(default)]
    pub client_ref: Option<ProvisionalId>,
}

/// A conversation summary as returned by the REST list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConversation {
    /// Server conversation id.
    #[serde(alias = "_id")]
    pub id: String,
    /// The other participant.
    pub counterpart_id: UserId,
    /// Preview of the newest message.
    #[serde(default)]
    pub last_message: Option<String>,
    /// Time of the newest activity.
    pub last_activity_at: Timestamp,
    /// Unread messages addressed to the requesting user.
    #[serde(default)]
    pub unread_count: u32,
}

/// Error returned when a wire record cannot become a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedRecord {
    /// The record carries no usable id.
    #[error("message record has no id")]
    MissingId,
}

/// Error returned when an outgoing message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither body nor attachment present.
    #[error("message is empty")]
    Empty,
    /// Body exceeds [`MAX_BODY_SIZE`].
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// A message inside a conversation timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Provisional or confirmed id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_key: ConversationKey,
    /// Server conversation id, if known.
    pub conversation_id: Option<String>,
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
    /// Text body.
    pub body: String,
    /// Attached media.
    pub attachment: Option<Attachment>,
    /// Creation time (local clock for provisional messages).
    pub created_at: Timestamp,
    /// Read flag.
    pub is_read: bool,
    /// Embedded offer.
    pub offer: Option<Offer>,
    /// The provisional id this confirmed message supersedes, if any.
    pub client_ref: Option<ProvisionalId>,
}

impl Message {
    /// Builds a provisional message for a local send.
    #[must_use]
    pub fn provisional(
        id: ProvisionalId,
        sender_id: UserId,
        receiver_id: UserId,
        body: String,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            id: MessageId::Provisional(id),
            conversation_key: ConversationKey::between(&sender_id, &receiver_id),
            conversation_id: None,
            sender_id,
            receiver_id,
            body,
            attachment,
            created_at: Timestamp::now(),
            is_read: false,
            offer: None,
            client_ref: None,
        }
    }

    /// Converts a wire record, rejecting records without an id.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedRecord::MissingId`] if the id is absent or blank.
    pub fn from_wire(wire: WireMessage) -> Result<Self, MalformedRecord> {
        let id = match wire.id.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => MessageId::from_wire(raw),
            _ => return Err(MalformedRecord::MissingId),
        };
        Ok(Self {
            id,
            conversation_key: ConversationKey::between(&wire.sender_id, &wire.receiver_id),
            conversation_id: wire.conversation_id,
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            body: wire.body,
            attachment: wire.attachment,
            created_at: wire.created_at,
            is_read: wire.is_read,
            offer: wire.offer,
            client_ref: wire.client_ref,
        })
    }

    /// Order id of the embedded offer, if any.
    #[must_use]
    pub fn order_id(&self) -> Option<&str> {
        self.offer.as_ref().map(|offer| offer.order_id.as_str())
    }

    /// One-line preview used by conversation summaries.
    #[must_use]
    pub fn summary(&self) -> String {
        if !self.body.is_empty() {
            return self.body.clone();
        }
        if let Some(offer) = &self.offer {
            return format!("Offer {} ({})", offer.order_id, offer.status);
        }
        match self.attachment.as_ref().map(|a| a.kind) {
            Some(AttachmentKind::Image) => "[image]".to_string(),
            Some(AttachmentKind::Video) => "[video]".to_string(),
            Some(AttachmentKind::File) => "[file]".to_string(),
            None => String::new(),
        }
    }
}

/// Validates an outgoing draft.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for an empty body without attachment, or
/// [`ValidationError::TooLarge`] if the body exceeds [`MAX_BODY_SIZE`].
pub const fn validate_draft(body: &str, has_attachment: bool) -> Result<(), ValidationError> {
    if body.is_empty() && !has_attachment {
        return Err(ValidationError::Empty);
    }
    if body.len() > MAX_BODY_SIZE {
        return Err(ValidationError::TooLarge {
            size: body.len(),
            max: MAX_BODY_SIZE,
        });
    }
    Ok(())
}
