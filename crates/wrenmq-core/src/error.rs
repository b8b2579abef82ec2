//! Protocol and validation error types.

use thiserror::Error;

/// Errors raised while decoding bytes received from the network.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("incomplete packet: needed {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("packet too large: {size} bytes exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("invalid protocol name")]
    InvalidProtocolName,

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Errors raised while validating fields before they reach the wire.
///
/// Validation always happens on the sending side, before any transport
/// activity, so a failed send never leaves a half-written packet behind.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    EmptyString { field: &'static str },

    #[error("{field} exceeds {max} characters")]
    StringTooLong { field: &'static str, max: usize },

    #[error("{field} must contain only single-byte characters")]
    NonAsciiString { field: &'static str },

    #[error("client id must be between 1 and 23 characters")]
    InvalidClientId,

    #[error("message id must be non-zero")]
    ZeroMessageId,

    #[error("message id required for QoS above 0")]
    MissingMessageId,

    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
