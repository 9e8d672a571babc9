//! Provides an asynchronous client for a Seplos BMS using Tokio and the
//! `tokio-serial` crate for serial communication.
//!
//! This module is suitable for applications built on the Tokio runtime.
//!
//! # Example
//!
//! ```no_run
//! use seplosbms_lib::tokio_serial_async::SeplosBMS;
//! use seplosbms_lib::Error;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut bms = SeplosBMS::new("/dev/ttyUSB0")?;
//!     bms.set_timeout(Duration::from_secs(2));
//!
//!     let version = bms.get_protocol_version().await?;
//!     println!("Protocol version: {version}");
//!
//!     // any other command, the payload is passed through untouched
//!     let reply = bms.command(0x42, &[0x00]).await?;
//!     println!("Status: {}, payload: {:02X?}", reply.status(), reply.payload);
//!
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::protocol::{self, Frame, ProtocolVersion, MINIMUM_DELAY, MIN_FRAME_LENGTH};
use crate::transaction::{Transaction, TransactionState};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

pub const BAUD_RATE: u32 = 19200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Asynchronous duplex byte stream to the BMS.
pub trait AsyncChannel: AsyncRead + AsyncWrite + Unpin {
    /// Throws away any unread input without waiting for more.
    fn discard_input(&mut self) -> Result<()>;
}

impl AsyncChannel for tokio_serial::SerialStream {
    fn discard_input(&mut self) -> Result<()> {
        let pending = self.bytes_to_read().map_err(io::Error::from)?;
        if pending > 0 {
            log::trace!("discard {pending} pending bytes");
        }
        self.clear(tokio_serial::ClearBuffer::Input)
            .map_err(io::Error::from)?;
        Ok(())
    }
}

async fn read_exact_within<C: AsyncChannel + ?Sized>(
    channel: &mut C,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    // a dropped read_exact may have consumed part of the reply, the next
    // transaction discards the rest
    match tokio::time::timeout(timeout, channel.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => {
            log::trace!("read of {} bytes timed out", buf.len());
            Err(Error::ResponseTimeout(timeout))
        }
    }
}

/// Sends one command and waits for its reply, see [`crate::transaction::execute`].
pub async fn execute<C: AsyncChannel + ?Sized>(
    channel: &mut C,
    address: u8,
    function: u8,
    payload: &[u8],
    timeout: Duration,
) -> Result<Frame> {
    let mut transaction = Transaction::new(address, function);
    let result = exchange(&mut transaction, channel, address, function, payload, timeout).await;
    transaction.finish(result)
}

async fn exchange<C: AsyncChannel + ?Sized>(
    transaction: &mut Transaction,
    channel: &mut C,
    address: u8,
    function: u8,
    payload: &[u8],
    timeout: Duration,
) -> Result<Frame> {
    channel.discard_input()?;

    let tx_buffer = protocol::encode_frame(address, function, payload)?;
    log::trace!("write bytes: {:?}", String::from_utf8_lossy(&tx_buffer));
    tokio::time::timeout(timeout, channel.write_all(&tx_buffer))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
    tokio::time::timeout(timeout, channel.flush())
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
    transaction.enter(TransactionState::Sent);

    transaction.enter(TransactionState::AwaitingHeader);
    let mut rx_buffer = vec![0; MIN_FRAME_LENGTH];
    read_exact_within(channel, &mut rx_buffer, timeout).await?;

    let header = protocol::parse_header(&rx_buffer)?;
    transaction.enter(TransactionState::AwaitingPayload);
    rx_buffer.resize(header.frame_len(), 0);
    read_exact_within(channel, &mut rx_buffer[MIN_FRAME_LENGTH..], timeout).await?;

    log::trace!("receive_bytes: {:?}", String::from_utf8_lossy(&rx_buffer));
    protocol::decode_frame(&rx_buffer)
}

/// The main struct for interacting asynchronously with a Seplos BMS using Tokio.
///
/// Holds the serial stream exclusively, so commands issued through one
/// instance never overlap on the wire.
#[derive(Debug)]
pub struct SeplosBMS {
    serial: tokio_serial::SerialStream,
    address: u8,
    last_execution: Instant,
    io_timeout: Duration, // Timeout for each read phase
    delay: Duration,      // Delay between commands
    retries: u8,
}

impl SeplosBMS {
    /// Creates a new `SeplosBMS` instance for asynchronous communication.
    ///
    /// # Arguments
    ///
    /// * `port`: The path to the serial port device (e.g., `/dev/ttyUSB0` on Linux, `COM3` on Windows).
    pub fn new(port: &str) -> Result<Self> {
        let serial = tokio_serial::new(port, BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;
        Ok(Self {
            serial,
            address: 0,
            last_execution: Instant::now(),
            io_timeout: DEFAULT_TIMEOUT,
            delay: MINIMUM_DELAY,
            retries: 0,
        })
    }

    /// Address (0..=15) of the pack all further commands are sent to.
    pub fn set_address(&mut self, address: u8) -> Result<()> {
        if address > protocol::MAX_ADDRESS {
            return Err(Error::InvalidAddress(address));
        }
        self.address = address;
        Ok(())
    }

    /// sets the number of retries for a failed command
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Sets the minimum delay between sending commands to the BMS.
    ///
    /// If the provided `delay` is less than `MINIMUM_DELAY` from the `protocol` module,
    /// `MINIMUM_DELAY` will be used.
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    async fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            tokio::time::sleep(time_until_delay_reached).await;
        }
    }

    /// Sends `function` with an opaque `payload` and returns the reply.
    ///
    /// Transport and framing failures are repeated up to the configured number
    /// of retries. A reply with a non-normal status code is returned as is.
    pub async fn command(&mut self, function: u8, payload: &[u8]) -> Result<Frame> {
        let mut attempt = 0;
        loop {
            self.serial_await_delay().await;
            let result = execute(
                &mut self.serial,
                self.address,
                function,
                payload,
                self.io_timeout,
            )
            .await;
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

    /// Asynchronously retrieves the communication protocol version of the BMS.
    pub async fn get_protocol_version(&mut self) -> Result<ProtocolVersion> {
        log::trace!("get protocol version");
        let frame = self
            .command(
                protocol::Command::ProtocolVersionGet.into(),
                &[ProtocolVersion::PACK],
            )
            .await?;
        ProtocolVersion::decode(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, ResponseCode};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    impl AsyncChannel for DuplexStream {
        fn discard_input(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Stream that accepts writes but fails every flush.
    struct FlushFails(DuplexStream);

    impl AsyncRead for FlushFails {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FlushFails {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "flush failed")))
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl AsyncChannel for FlushFails {
        fn discard_input(&mut self) -> Result<()> {
            Ok(())
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(50);

    /// Reads one request frame from the device side and answers with `reply`.
    async fn answer(device: &mut DuplexStream, reply: &[u8]) -> Vec<u8> {
        let mut request = vec![0; MIN_FRAME_LENGTH];
        device.read_exact(&mut request).await.unwrap();
        let header = protocol::parse_header(&request).unwrap();
        request.resize(header.frame_len(), 0);
        device
            .read_exact(&mut request[MIN_FRAME_LENGTH..])
            .await
            .unwrap();
        device.write_all(reply).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_execute_returns_reply() {
        let (mut client, mut device) = tokio::io::duplex(8192);
        let reply = encode_frame(1, 0x00, &[0xDE, 0xAD]).unwrap();
        let device_task = tokio::spawn(async move { answer(&mut device, &reply).await });

        let frame = execute(&mut client, 1, 0x42, &[0x01], TIMEOUT).await.unwrap();
        assert_eq!(frame.address, 1);
        assert_eq!(frame.into_parts(), (0x00, vec![0xDE, 0xAD]));

        let request = device_task.await.unwrap();
        assert_eq!(request, encode_frame(1, 0x42, &[0x01]).unwrap());
    }

    #[tokio::test]
    async fn test_execute_device_status() {
        let (mut client, mut device) = tokio::io::duplex(8192);
        let reply = encode_frame(0, 0x02, &[]).unwrap();
        let device_task = tokio::spawn(async move { answer(&mut device, &reply).await });

        let frame = execute(&mut client, 0, 0x4F, &[0x00], TIMEOUT).await.unwrap();
        assert_eq!(frame.status(), ResponseCode::ChecksumError);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_silent_device_times_out_twice() {
        // keep the device end open but never answer
        let (mut client, _device) = tokio::io::duplex(8192);
        let start = Instant::now();
        for _ in 0..2 {
            assert!(matches!(
                execute(&mut client, 0, 0x4F, &[0x00], TIMEOUT).await,
                Err(Error::ResponseTimeout(t)) if t == TIMEOUT
            ));
        }
        assert!(start.elapsed() < TIMEOUT * 2 + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_execute_truncated_reply_times_out() {
        let (mut client, mut device) = tokio::io::duplex(8192);
        let reply = encode_frame(0, 0x00, &[]).unwrap();
        let device_task = tokio::spawn(async move {
            answer(&mut device, &reply[..17]).await;
            device
        });

        assert!(matches!(
            execute(&mut client, 0, 0x4F, &[], TIMEOUT).await,
            Err(Error::ResponseTimeout(_))
        ));
        drop(device_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_closed_channel_is_io_error() {
        let (mut client, device) = tokio::io::duplex(8192);
        drop(device);
        assert!(matches!(
            execute(&mut client, 0, 0x4F, &[], TIMEOUT).await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_checksum_mismatch() {
        let (mut client, mut device) = tokio::io::duplex(8192);
        let mut reply = encode_frame(0, 0x00, &[0x01]).unwrap();
        reply[3] = b'9';
        let device_task = tokio::spawn(async move { answer(&mut device, &reply).await });

        assert!(matches!(
            execute(&mut client, 0, 0x42, &[], TIMEOUT).await,
            Err(Error::ChecksumMismatch { .. })
        ));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_request_larger_than_channel_buffer() {
        // the 98 byte request only fits through the 32 byte pipe in pieces
        let (mut client, mut device) = tokio::io::duplex(32);
        let reply = encode_frame(0, 0x00, &[0x07]).unwrap();
        let device_task = tokio::spawn(async move { answer(&mut device, &reply).await });

        let frame = execute(&mut client, 0, 0x42, &[0x11; 40], Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(frame.into_parts(), (0x00, vec![0x07]));

        let request = device_task.await.unwrap();
        assert_eq!(request.len(), 18 + 80);
        assert_eq!(request, encode_frame(0, 0x42, &[0x11; 40]).unwrap());
    }

    #[tokio::test]
    async fn test_execute_flush_error_is_io_error() {
        let (client, _device) = tokio::io::duplex(8192);
        let mut client = FlushFails(client);
        assert!(matches!(
            execute(&mut client, 0, 0x4F, &[0x00], TIMEOUT).await,
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::BrokenPipe
        ));
    }

    #[tokio::test]
    async fn test_execute_recovers_after_timeout() {
        let (mut client, mut device) = tokio::io::duplex(8192);
        let reply = encode_frame(2, 0x00, &[0x10]).unwrap();
        let device_task = tokio::spawn(async move {
            // first request only gets the start of a reply
            answer(&mut device, &reply[..10]).await;
            let request = answer(&mut device, &reply).await;
            (device, request)
        });

        assert!(matches!(
            execute(&mut client, 2, 0x4F, &[0x02], TIMEOUT).await,
            Err(Error::ResponseTimeout(_))
        ));
        let frame = execute(&mut client, 2, 0x4F, &[0x02], TIMEOUT).await.unwrap();
        assert_eq!(frame.address, 2);
        assert_eq!(frame.into_parts(), (0x00, vec![0x10]));

        let (_device, request) = device_task.await.unwrap();
        assert_eq!(request, encode_frame(2, 0x4F, &[0x02]).unwrap());
    }
}
