//! Remaining-length encoding.
//!
//! The fixed header carries the byte length of the rest of the packet as a
//! base-128 varint, 7 value bits per byte with the high bit as a
//! continuation flag:
//! - 0..=127: 1 byte
//! - 128..=16383: 2 bytes
//! - 16384..=2097151: 3 bytes
//! - 2097152..=268435455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value the four-byte encoding can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode a remaining length from the front of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success, `Ok(None)` when
/// the buffer ends before the final byte, or an error when a fifth
/// continuation byte appears.
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;

        if multiplier > 128 * 128 * 128 {
            return Err(ProtocolError::InvalidRemainingLength);
        }

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    Ok(None)
}

/// Append the varint encoding of `value` to `buf`, returning the number of
/// bytes written.
pub fn encode_to_vec(mut value: u32, buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Number of bytes `value` occupies when encoded.
pub fn encoded_len(mut value: u32) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}
