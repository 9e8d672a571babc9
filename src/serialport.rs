//! Synchronous client using the `serialport` crate.
//!
//! # Example
//!
//! ```no_run
//! use seplosbms_lib::serialport::SeplosBMS;
//! use std::time::Duration;
//!
//! let mut bms = SeplosBMS::new("/dev/ttyUSB0").unwrap();
//! bms.set_timeout(Duration::from_secs(2));
//! println!("Protocol version: {}", bms.get_protocol_version().unwrap());
//! ```

use crate::error::{Error, Result};
use crate::protocol::{Frame, ProtocolVersion, MINIMUM_DELAY};
use crate::transaction::{self, Channel};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

pub const BAUD_RATE: u32 = 19200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens `port` with the line settings of the BMS (19200 8N1, no flow control).
pub fn open(port: &str) -> Result<Box<dyn serialport::SerialPort>> {
    serialport::new(port, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(DEFAULT_TIMEOUT)
        .open()
        .map_err(|err| {
            log::warn!("Cannot open serial port '{}': {}", port, err);
            Error::Io(io::Error::from(err))
        })
}

impl Channel for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> Result<()> {
        let pending = self.bytes_to_read().map_err(io::Error::from)?;
        if pending > 0 {
            log::trace!("Discard {} pending bytes", pending);
        }
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match Write::write(self, &buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Write::flush(self)?;
        Ok(written)
    }

    fn read_exact_within(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::trace!("Read timed out after {} of {} bytes", filled, buf.len());
                return Err(Error::ResponseTimeout(timeout));
            }
            self.set_timeout(remaining).map_err(io::Error::from)?;
            match Read::read(self, &mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    )))
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    log::trace!("Read timed out after {} of {} bytes", filled, buf.len());
                    return Err(Error::ResponseTimeout(timeout));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SeplosBMS {
    serial: Box<dyn serialport::SerialPort>,
    address: u8,
    last_execution: Instant,
    timeout: Duration,
    delay: Duration,
    retries: u8,
}

impl SeplosBMS {
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self::with_port(open(port)?))
    }

    /// Wraps an already opened and configured port.
    pub fn with_port(serial: Box<dyn serialport::SerialPort>) -> Self {
        Self {
            serial,
            address: 0,
            last_execution: Instant::now(),
            timeout: DEFAULT_TIMEOUT,
            delay: MINIMUM_DELAY,
            retries: 0,
        }
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    /// Address (0..=15) of the pack all further commands are sent to.
    pub fn set_address(&mut self, address: u8) -> Result<()> {
        if address > crate::protocol::MAX_ADDRESS {
            return Err(Error::InvalidAddress(address));
        }
        self.address = address;
        Ok(())
    }

    /// Timeout for each of the two reads of a reply.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    /// Number of times a command is repeated after a transport or framing failure.
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    /// Sends `function` with an opaque `payload` and returns the reply.
    ///
    /// The reply may carry a non-normal status code, see [`Frame::status`].
    pub fn command(&mut self, function: u8, payload: &[u8]) -> Result<Frame> {
        let mut attempt = 0;
        loop {
            self.serial_await_delay();
            let result = transaction::execute(
                &mut self.serial,
                self.address,
                function,
                payload,
                self.timeout,
            );
            self.last_execution = Instant::now();
            match result {
                Err(err @ (Error::InvalidAddress(_) | Error::PayloadTooLarge { .. })) => {
                    return Err(err)
                }
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    log::trace!(
                        "Failed try {} of {}, repeating ({err})",
                        attempt,
                        u16::from(self.retries) + 1
                    );
                }
                result => return result,
            }
        }
    }

    pub fn get_protocol_version(&mut self) -> Result<ProtocolVersion> {
        log::trace!("get protocol version");
        let frame = self.command(
            crate::protocol::Command::ProtocolVersionGet.into(),
            &[ProtocolVersion::PACK],
        )?;
        ProtocolVersion::decode(&frame)
    }
}
