//! Varint encoding (LEB128) for channel indices, sequence numbers and lengths.
//!
//! Small values use fewer bytes:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//!
//! A u64 never needs more than [`MAX_VARINT_LEN`] bytes. Varints have no byte
//! order, so they decode identically regardless of the Hello byte-order flag.

use crate::error::FrameError;

/// Longest valid varint encoding
pub const MAX_VARINT_LEN: usize = 10;

/// Append a varint to a buffer
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read a varint from the front of a slice, returning `(value, bytes_consumed)`
///
/// # Errors
///
/// Returns `FrameError::TooShort` if the slice ends mid-varint and
/// `FrameError::VarintOverflow` if the encoding exceeds 64 bits.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize), FrameError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (pos, &byte) in data.iter().enumerate() {
        let bits = u64::from(byte & 0x7F);

        // The tenth byte may only carry the top bit of a u64
        if shift == 63 && bits > 1 {
            return Err(FrameError::VarintOverflow);
        }
        result |= bits << shift;

        if byte & 0x80 == 0 {
            return Ok((result, pos + 1));
        }

        shift += 7;
        if shift >= 64 {
            return Err(FrameError::VarintOverflow);
        }
    }

    Err(FrameError::TooShort {
        expected: data.len() + 1,
        actual: data.len(),
    })
}

/// Number of bytes needed to encode a value as a varint
#[must_use]
pub fn varint_size(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7)
}
