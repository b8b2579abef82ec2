//! Field validation applied before encoding.
//!
//! String fields are restricted to single-byte characters. The wire length
//! prefix counts bytes while callers reason in characters; rejecting
//! multi-byte characters keeps the two in agreement with peers that made the
//! same restriction. Decoding does not re-validate, so strings received from
//! a more permissive peer still parse.

use crate::error::ValidationError;

/// Client identifiers are limited to 23 characters by MQTT 3.1.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// String fields carry a 16-bit length prefix.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Largest permitted remaining length, and therefore the ceiling for any
/// configured maximum message size.
pub const MAX_MESSAGE_SIZE: usize = 268_435_455;

pub fn validate_string(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.chars().count() > MAX_STRING_LEN {
        return Err(ValidationError::StringTooLong {
            field,
            max: MAX_STRING_LEN,
        });
    }
    // Byte length equals character count only when every character is
    // single-byte.
    if value.len() != value.chars().count() {
        return Err(ValidationError::NonAsciiString { field });
    }
    Ok(())
}

pub fn validate_required_string(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyString { field });
    }
    validate_string(value, field)
}

pub fn validate_client_id(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(ValidationError::InvalidClientId);
    }
    validate_string(value, "client id")
}

pub fn validate_message_id(id: u16) -> Result<(), ValidationError> {
    if id == 0 {
        return Err(ValidationError::ZeroMessageId);
    }
    Ok(())
}

pub fn validate_max_message_size(size: usize) -> Result<(), ValidationError> {
    if size == 0 || size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
