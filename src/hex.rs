//! Uppercase ASCII-hex encoding used by every field of a frame.

use crate::error::{Error, Result};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Two uppercase hex characters, high nibble first.
pub fn encode_byte(value: u8) -> [u8; 2] {
    [
        HEX_DIGITS[usize::from(value >> 4)],
        HEX_DIGITS[usize::from(value & 0x0F)],
    ]
}

/// Four uppercase hex characters, most significant nibble first.
pub fn encode_u16(value: u16) -> [u8; 4] {
    let [high, low] = value.to_be_bytes();
    let [a, b] = encode_byte(high);
    let [c, d] = encode_byte(low);
    [a, b, c, d]
}

/// Appends two hex characters per byte of `bytes` to `dst`.
pub fn encode_into(bytes: &[u8], dst: &mut Vec<u8>) {
    dst.reserve(bytes.len() * 2);
    for b in bytes {
        dst.extend_from_slice(&encode_byte(*b));
    }
}

/// Value of one hex character, either case is accepted.
pub fn decode_nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(Error::InvalidHexDigit(c)),
    }
}

/// Byte from two hex characters, high nibble first.
pub fn decode_byte(chars: [u8; 2]) -> Result<u8> {
    Ok((decode_nibble(chars[0])? << 4) | decode_nibble(chars[1])?)
}

/// Big-endian `u16` from four hex characters.
pub fn decode_u16(chars: [u8; 4]) -> Result<u16> {
    chars.iter().try_fold(0u16, |acc, c| -> Result<u16> {
        Ok((acc << 4) | u16::from(decode_nibble(*c)?))
    })
}

/// Decodes a run of hex characters into raw bytes.
pub fn decode_bytes(chars: &[u8]) -> Result<Vec<u8>> {
    if chars.len() % 2 != 0 {
        return Err(Error::MalformedFrame("odd number of hex characters"));
    }
    chars
        .chunks_exact(2)
        .map(|pair| decode_byte([pair[0], pair[1]]))
        .collect()
}
