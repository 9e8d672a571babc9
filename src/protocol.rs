use crate::checksum::{frame_checksum, length_checksum, length_field, split_length_field};
use crate::error::{Error, Result};
use crate::hex;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// Some USB - RS485 dongles need a moment to switch between TX and RX,
// one character takes about 0.5ms at 19200 baud
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(2);

pub const START_BYTE: u8 = b'~';
pub const END_BYTE: u8 = b'\r';
/// Protocol version 2.0
pub const PROTOCOL_VERSION: u8 = 0x20;
/// Device type code of a battery
pub const DEVICE_BATTERY: u8 = 0x46;
pub const MAX_ADDRESS: u8 = 15;
/// Maximum number of hex characters in the info (payload) field
pub const MAX_INFO_LENGTH: usize = 4095;
/// Maximum number of raw payload bytes
pub const MAX_PAYLOAD_LENGTH: usize = MAX_INFO_LENGTH / 2;

/// start + version + address + device + function + length
pub const HEADER_LENGTH: usize = 13;
const CHECKSUM_LENGTH: usize = 4;
/// Length of a frame with an empty info field
pub const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + CHECKSUM_LENGTH + 1;

/// Function codes of the requests understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    TelemetryGet = 0x42,
    TelecommandGet = 0x44,
    TelecontrolCommand = 0x45,
    TeleregulationGet = 0x47,
    TeleregulationSet = 0x49,
    HistoryGet = 0x4B,
    TimeGet = 0x4D,
    TimeSet = 0x4E,
    ProtocolVersionGet = 0x4F,
    VendorGet = 0x51,
    ProductionCalibration = 0xA0,
    ProductionSetting = 0xA1,
    RegularRecording = 0xA2,
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command as u8
    }
}

/// Status code carried in the function field of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResponseCode {
    Normal,
    VersionError,
    ChecksumError,
    LengthChecksumError,
    Cid2Error,
    CommandFormatError,
    DataInvalid,
    NoHistory,
    Cid1Error,
    ExecutionFailure,
    DeviceFault,
    PermissionError,
    Unknown(u8),
}

impl From<u8> for ResponseCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ResponseCode::Normal,
            0x01 => ResponseCode::VersionError,
            0x02 => ResponseCode::ChecksumError,
            0x03 => ResponseCode::LengthChecksumError,
            0x04 => ResponseCode::Cid2Error,
            0x05 => ResponseCode::CommandFormatError,
            0x06 => ResponseCode::DataInvalid,
            0x07 => ResponseCode::NoHistory,
            0xE1 => ResponseCode::Cid1Error,
            0xE2 => ResponseCode::ExecutionFailure,
            0xE3 => ResponseCode::DeviceFault,
            0xE4 => ResponseCode::PermissionError,
            other => ResponseCode::Unknown(other),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> u8 {
        match code {
            ResponseCode::Normal => 0x00,
            ResponseCode::VersionError => 0x01,
            ResponseCode::ChecksumError => 0x02,
            ResponseCode::LengthChecksumError => 0x03,
            ResponseCode::Cid2Error => 0x04,
            ResponseCode::CommandFormatError => 0x05,
            ResponseCode::DataInvalid => 0x06,
            ResponseCode::NoHistory => 0x07,
            ResponseCode::Cid1Error => 0xE1,
            ResponseCode::ExecutionFailure => 0xE2,
            ResponseCode::DeviceFault => 0xE3,
            ResponseCode::PermissionError => 0xE4,
            ResponseCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResponseCode::Normal => write!(f, "Normal response"),
            ResponseCode::VersionError => write!(f, "Protocol version error"),
            ResponseCode::ChecksumError => write!(f, "Checksum error"),
            ResponseCode::LengthChecksumError => write!(f, "Length checksum error"),
            ResponseCode::Cid2Error => write!(f, "Invalid function code (CID2)"),
            ResponseCode::CommandFormatError => write!(f, "Command format error"),
            ResponseCode::DataInvalid => write!(f, "Invalid data"),
            ResponseCode::NoHistory => write!(f, "No historical data"),
            ResponseCode::Cid1Error => write!(f, "Invalid device type (CID1)"),
            ResponseCode::ExecutionFailure => write!(f, "Command execution failure"),
            ResponseCode::DeviceFault => write!(f, "Device fault"),
            ResponseCode::PermissionError => write!(f, "Permission error"),
            ResponseCode::Unknown(code) => write!(f, "Unknown response code {code:#04X}"),
        }
    }
}

/// The fixed size head of a frame, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub address: u8,
    pub device: u8,
    pub function: u8,
    /// Number of hex characters in the info field
    pub info_length: usize,
}

impl Header {
    /// Total number of bytes of the frame this header belongs to.
    pub fn frame_len(&self) -> usize {
        MIN_FRAME_LENGTH + self.info_length
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    pub version: u8,
    pub address: u8,
    pub device: u8,
    /// Command code in requests, status code in replies
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn status(&self) -> ResponseCode {
        ResponseCode::from(self.function)
    }

    /// Splits the frame into `(status_code, payload)`.
    pub fn into_parts(self) -> (u8, Vec<u8>) {
        (self.function, self.payload)
    }
}

fn hex_pair(buffer: &[u8], offset: usize) -> Result<u8> {
    hex::decode_byte([buffer[offset], buffer[offset + 1]])
}

/// Builds a request frame.
///
/// ```
/// use seplosbms_lib::protocol::{encode_frame, Command};
///
/// let frame = encode_frame(0, Command::ProtocolVersionGet.into(), &[]).unwrap();
/// assert_eq!(frame, b"~2000464F0000FD9A\r");
/// ```
pub fn encode_frame(address: u8, function: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if address > MAX_ADDRESS {
        return Err(Error::InvalidAddress(address));
    }
    let info_length = payload.len() * 2;
    if info_length > MAX_INFO_LENGTH {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LENGTH,
        });
    }

    let mut tx_buffer = Vec::with_capacity(MIN_FRAME_LENGTH + info_length);
    tx_buffer.push(START_BYTE);
    tx_buffer.extend_from_slice(&hex::encode_byte(PROTOCOL_VERSION));
    tx_buffer.extend_from_slice(&hex::encode_byte(address));
    tx_buffer.extend_from_slice(&hex::encode_byte(DEVICE_BATTERY));
    tx_buffer.extend_from_slice(&hex::encode_byte(function));
    tx_buffer.extend_from_slice(&hex::encode_u16(length_field(info_length as u16)));
    hex::encode_into(payload, &mut tx_buffer);
    let checksum = frame_checksum(&tx_buffer[1..]);
    tx_buffer.extend_from_slice(&hex::encode_u16(checksum));
    tx_buffer.push(END_BYTE);

    log::trace!("encode_frame: {:?}", String::from_utf8_lossy(&tx_buffer));
    Ok(tx_buffer)
}

/// Decodes the first [`HEADER_LENGTH`] bytes of a frame.
///
/// The length field is verified here, before anything depending on the
/// declared length is looked at.
pub fn parse_header(rx_buffer: &[u8]) -> Result<Header> {
    if rx_buffer.len() < HEADER_LENGTH {
        return Err(Error::Truncated {
            expected: HEADER_LENGTH,
            received: rx_buffer.len(),
        });
    }
    if rx_buffer[0] != START_BYTE {
        log::warn!("Invalid start byte - received={:02X?}", rx_buffer[0]);
        return Err(Error::MalformedFrame("invalid start byte"));
    }

    let version = hex_pair(rx_buffer, 1)?;
    let address = hex_pair(rx_buffer, 3)?;
    let device = hex_pair(rx_buffer, 5)?;
    let function = hex_pair(rx_buffer, 7)?;
    let field = hex::decode_u16([rx_buffer[9], rx_buffer[10], rx_buffer[11], rx_buffer[12]])?;

    let (received, info_length) = split_length_field(field);
    let calculated = length_checksum(info_length);
    if received != calculated {
        log::warn!(
            "Invalid length checksum - calculated={:X} received={:X} length={}",
            calculated,
            received,
            info_length
        );
        return Err(Error::LengthChecksumMismatch {
            calculated,
            received,
        });
    }

    Ok(Header {
        version,
        address,
        device,
        function,
        info_length: usize::from(info_length),
    })
}

fn validate_len(rx_buffer: &[u8], frame_len: usize) -> Result<()> {
    if rx_buffer.len() < frame_len {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            frame_len,
            rx_buffer.len()
        );
        return Err(Error::Truncated {
            expected: frame_len,
            received: rx_buffer.len(),
        });
    }
    if rx_buffer.len() > frame_len {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            frame_len,
            rx_buffer.len()
        );
        return Err(Error::MalformedFrame("trailing bytes after frame"));
    }
    Ok(())
}

fn validate_checksum(rx_buffer: &[u8], body_end: usize) -> Result<()> {
    let calculated = frame_checksum(&rx_buffer[1..body_end]);
    let received = hex::decode_u16([
        rx_buffer[body_end],
        rx_buffer[body_end + 1],
        rx_buffer[body_end + 2],
        rx_buffer[body_end + 3],
    ])?;
    if received != calculated {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={:?}",
            calculated,
            received,
            String::from_utf8_lossy(rx_buffer)
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

/// Validates a complete frame and decodes it.
///
/// Checks run in wire order and the first failing one aborts the decode.
pub fn decode_frame(rx_buffer: &[u8]) -> Result<Frame> {
    let header = parse_header(rx_buffer)?;
    let frame_len = header.frame_len();
    validate_len(rx_buffer, frame_len)?;

    let body_end = HEADER_LENGTH + header.info_length;
    let info_and_checksum = &rx_buffer[HEADER_LENGTH..body_end + CHECKSUM_LENGTH];
    if let Some(c) = info_and_checksum
        .iter()
        .find(|c| hex::decode_nibble(**c).is_err())
    {
        log::warn!("Non hex character {:02X?} in info or checksum field", c);
        return Err(Error::InvalidHexDigit(*c));
    }

    validate_checksum(rx_buffer, body_end)?;

    if rx_buffer[frame_len - 1] != END_BYTE {
        log::warn!("Invalid end byte - received={:02X?}", rx_buffer[frame_len - 1]);
        return Err(Error::MalformedFrame("invalid end byte"));
    }

    let payload = hex::decode_bytes(&rx_buffer[HEADER_LENGTH..body_end])?;
    Ok(Frame {
        version: header.version,
        address: header.address,
        device: header.device,
        function: header.function,
        payload,
    })
}

/// Communication protocol version reported by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    /// For this command the BMS parses the address, but not the pack number.
    pub const PACK: u8 = 0x00;

    pub fn request(address: u8) -> Result<Vec<u8>> {
        encode_frame(address, Command::ProtocolVersionGet.into(), &[Self::PACK])
    }

    /// The version is taken from the version field of the reply, not from its payload.
    pub fn decode(frame: &Frame) -> Result<Self> {
        match frame.status() {
            ResponseCode::Normal => Ok(Self {
                major: frame.version >> 4,
                minor: frame.version & 0x0F,
            }),
            status => {
                log::warn!("Protocol version request answered with: {status}");
                Err(Error::DeviceStatus(status))
            }
        }
    }

    pub fn as_f32(&self) -> f32 {
        self.major as f32 + self.minor as f32 / 10.0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
