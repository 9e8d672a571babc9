use crate::protocol::ResponseCode;
use std::time::Duration;

/// Transport and framing failures of a single transaction.
///
/// Every variant except [`Error::DeviceStatus`] can be returned by the
/// transaction engine. A reply carrying a non-zero status code is not an error
/// of the engine; only the command helpers turn it into `DeviceStatus`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error from the underlying channel, including short writes.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// No (complete) response arrived within the deadline.
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    /// A character outside `0-9A-Fa-f` where a hex digit was expected.
    #[error("invalid hex digit {0:#04x}")]
    InvalidHexDigit(u8),
    /// The checksum nibble of the length field does not match the length.
    #[error("length checksum mismatch - calculated={calculated:X} received={received:X}")]
    LengthChecksumMismatch { calculated: u8, received: u8 },
    /// The frame checksum does not match the frame body.
    #[error("checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// The frame is structurally broken (start byte, terminator, sizes).
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    /// Device addresses are limited to `0..=15`.
    #[error("invalid address {0}, expected 0..=15")]
    InvalidAddress(u8),
    /// The payload does not fit into the info field of a frame.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    /// The codec was handed fewer bytes than the frame header declares.
    #[error("truncated frame - expected={expected} received={received}")]
    Truncated { expected: usize, received: usize },
    /// The device answered with a non-normal response code.
    #[error("device responded with: {0}")]
    DeviceStatus(ResponseCode),
}

pub type Result<T> = std::result::Result<T, Error>;
