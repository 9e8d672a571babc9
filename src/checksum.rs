//! The two checksums of a frame: a nibble guarding the length field and a
//! 16 bit additive checksum over the frame body.

/// Largest value of the 12 bit length part of the length field.
pub const MAX_LENGTH_VALUE: u16 = 0x0FFF;

/// Checksum nibble for a 12 bit length value.
///
/// The three nibbles are summed and the low nibble of the two's complement of
/// that sum is the result. Bits above the 12 bit range are ignored.
pub fn length_checksum(length: u16) -> u8 {
    let sum = ((length >> 8) & 0x0F) + ((length >> 4) & 0x0F) + (length & 0x0F);
    (sum as u8).wrapping_neg() & 0x0F
}

/// Complete 16 bit length field: checksum nibble on top, length below.
pub fn length_field(length: u16) -> u16 {
    let length = length & MAX_LENGTH_VALUE;
    (u16::from(length_checksum(length)) << 12) | length
}

/// Splits a length field into `(checksum_nibble, length)`.
pub fn split_length_field(field: u16) -> (u8, u16) {
    ((field >> 12) as u8, field & MAX_LENGTH_VALUE)
}

/// Two's complement of the byte sum of `data`, truncated to 16 bits.
///
/// Applied to the ASCII characters of the frame, not to decoded values.
pub fn frame_checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
        .wrapping_neg()
}
