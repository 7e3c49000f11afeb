//! Error types for envelope decoding and validation.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while decoding or validating protocol messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// `@type` is not a well-formed message type URI
    #[error("invalid message type: {0:?}")]
    InvalidMessageType(String),

    /// DID does not follow `did:<method>:<id>`
    #[error("invalid DID: {0:?}")]
    InvalidDid(String),

    /// Envelope is not valid JSON or does not match the wire shape
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// `~content` does not match the payload shape of its kind
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// Message kind the payload was decoded for
        kind: String,
        /// Underlying decode failure
        source: serde_json::Error,
    },

    /// Invitation URL lacks a decodable `c_i` parameter
    #[error("invalid invitation URL: {0}")]
    InvalidInvitationUrl(String),
}
