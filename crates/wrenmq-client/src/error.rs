//! Client error types.

use thiserror::Error;
use wrenmq_core::packet::ConnectReturnCode;
use wrenmq_core::{ProtocolError, ValidationError};

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A field failed validation before anything reached the transport.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The broker answered CONNECT with a non-accepted return code.
    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    /// A pending request deadline elapsed without a response.
    #[error("peer not responding")]
    NotResponding,

    #[error("not connected")]
    NotConnected,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("duplicate subscription for filter: {0}")]
    DuplicateSubscription(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
