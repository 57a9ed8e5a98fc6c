//! JSON text-frame encoding for the socket protocol.
//!
//! The client encodes [`ClientEvent`]s and decodes [`ServerEvent`]s; the
//! reverse pair exists for in-process test servers.

use serde::Deserialize;

use crate::event::{ClientEvent, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame is not valid JSON or does not match any known event.
    #[error("malformed frame (event {event:?}): {reason}")]
    Malformed {
        /// The `event` name, if the frame carried one.
        event: Option<String>,
        /// Parser error.
        reason: String,
    },
}

/// Just enough of a frame to name it in error reports.
#[derive(Deserialize)]
struct FrameHeader {
    #[serde(default)]
    event: Option<String>,
}

fn malformed(text: &str, err: &serde_json::Error) -> CodecError {
    let event = serde_json::from_str::<FrameHeader>(text)
        .ok()
        .and_then(|h| h.event);
    CodecError::Malformed {
        event,
        reason: err.to_string(),
    }
}

/// Encodes a client frame as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a server frame from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the text is not a known server event.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    serde_json::from_str(text).map_err(|e| malformed(text, &e))
}

/// Encodes a server frame as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a client frame from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the text is not a known client event.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    serde_json::from_str(text).map_err(|e| malformed(text, &e))
}
