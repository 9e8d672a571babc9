//! One request/response exchange with the BMS.
//!
//! The engine keeps no state between calls. The channel is borrowed mutably for
//! the duration of [`execute`], so a single channel can never carry two
//! transactions at the same time.

use crate::error::{Error, Result};
use crate::protocol::{self, Frame, MIN_FRAME_LENGTH};
use std::fmt;
use std::time::Duration;

/// Duplex byte stream to the BMS, usually a serial port.
pub trait Channel {
    /// Throws away any unread input.
    fn discard_input(&mut self) -> Result<()>;

    /// Writes `buf` and returns the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Fills `buf` completely or fails with [`Error::ResponseTimeout`] once
    /// `timeout` has elapsed.
    fn read_exact_within(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Sent,
    AwaitingHeader,
    AwaitingPayload,
    Complete,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionState::Idle => write!(f, "idle"),
            TransactionState::Sent => write!(f, "sent"),
            TransactionState::AwaitingHeader => write!(f, "awaiting header"),
            TransactionState::AwaitingPayload => write!(f, "awaiting payload"),
            TransactionState::Complete => write!(f, "complete"),
            TransactionState::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of a single exchange, shared by the sync and async engines.
#[derive(Debug)]
pub(crate) struct Transaction {
    address: u8,
    function: u8,
    state: TransactionState,
}

impl Transaction {
    pub(crate) fn new(address: u8, function: u8) -> Self {
        Self {
            address,
            function,
            state: TransactionState::Idle,
        }
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn enter(&mut self, state: TransactionState) {
        log::trace!(
            "transaction address={} function={:#04X}: {} -> {}",
            self.address,
            self.function,
            self.state,
            state
        );
        self.state = state;
    }

    /// Records the outcome of the exchange and passes it through unchanged.
    pub(crate) fn finish(&mut self, result: Result<Frame>) -> Result<Frame> {
        match &result {
            Ok(frame) => {
                self.enter(TransactionState::Complete);
                if frame.function != 0 {
                    log::debug!("device reported status: {}", frame.status());
                }
            }
            Err(err) => {
                log::debug!("transaction failed in state {}: {err}", self.state());
                self.enter(TransactionState::Failed);
            }
        }
        result
    }
}

pub(crate) fn check_write(written: usize, expected: usize) -> Result<()> {
    if written != expected {
        log::warn!("Short write - written={} expected={}", written, expected);
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("short write, {written} of {expected} bytes"),
        )));
    }
    Ok(())
}

/// Sends one command and waits for its reply.
///
/// Both reads, the fixed size head and the variable remainder, get the full
/// `timeout` each. A reply with a non-zero status code is returned as `Ok`;
/// interpreting it is up to the caller. Nothing is retried here.
pub fn execute<C: Channel + ?Sized>(
    channel: &mut C,
    address: u8,
    function: u8,
    payload: &[u8],
    timeout: Duration,
) -> Result<Frame> {
    let mut transaction = Transaction::new(address, function);
    let result = exchange(&mut transaction, channel, address, function, payload, timeout);
    transaction.finish(result)
}

fn exchange<C: Channel + ?Sized>(
    transaction: &mut Transaction,
    channel: &mut C,
    address: u8,
    function: u8,
    payload: &[u8],
    timeout: Duration,
) -> Result<Frame> {
    // clear all incoming data to avoid mixing up a late reply with this one
    channel.discard_input()?;

    let tx_buffer = protocol::encode_frame(address, function, payload)?;
    log::trace!("write bytes: {:?}", String::from_utf8_lossy(&tx_buffer));
    check_write(channel.write(&tx_buffer)?, tx_buffer.len())?;
    transaction.enter(TransactionState::Sent);

    transaction.enter(TransactionState::AwaitingHeader);
    let mut rx_buffer = vec![0; MIN_FRAME_LENGTH];
    channel.read_exact_within(&mut rx_buffer, timeout)?;

    let header = protocol::parse_header(&rx_buffer)?;
    transaction.enter(TransactionState::AwaitingPayload);
    rx_buffer.resize(header.frame_len(), 0);
    channel.read_exact_within(&mut rx_buffer[MIN_FRAME_LENGTH..], timeout)?;

    log::trace!("receive_bytes: {:?}", String::from_utf8_lossy(&rx_buffer));
    protocol::decode_frame(&rx_buffer)
}
