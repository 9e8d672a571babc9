use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    let address: u8 = maybe_hex(s)?;
    if address > seplosbms_lib::protocol::MAX_ADDRESS {
        return Err(format!(
            "address has to be between 0 and {}",
            seplosbms_lib::protocol::MAX_ADDRESS
        ));
    }
    Ok(address)
}

/// Opaque command payload given as hex string on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct HexPayload(pub Vec<u8>);

fn parse_payload(s: &str) -> Result<HexPayload, String> {
    seplosbms_lib::hex::decode_bytes(s.as_bytes())
        .map(HexPayload)
        .map_err(|err| err.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the communication protocol version of the BMS
    ProtocolVersion,
    /// Send a command with an arbitrary function code and show the raw reply
    Command {
        /// Function code, decimal or hex with 0x prefix (e.g. 0x42)
        #[arg(value_parser = maybe_hex::<u8>)]
        function: u8,
        /// Payload as hex string (e.g. "00" for pack 0)
        #[arg(value_parser = parse_payload, default_value = "")]
        payload: HexPayload,
    },
}

const fn about_text() -> &'static str {
    "seplos bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Address of the battery pack (0-15)
    #[arg(short, long, value_parser = parse_address, default_value = "0")]
    pub address: u8,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for each read of a reply (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between sending multiple commands to the BMS (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "50ms")]
    pub delay: Duration,

    /// Number of retries for failed commands
    #[arg(long, default_value = "0")]
    pub retries: u8,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let args = CliArgs::try_parse_from([
            "seplosbms",
            "--address",
            "0x0A",
            "command",
            "0x42",
            "00",
        ])
        .unwrap();
        assert_eq!(args.address, 10);
        assert_eq!(
            args.command,
            CliCommands::Command {
                function: 0x42,
                payload: HexPayload(vec![0x00]),
            }
        );
        assert_eq!(args.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_rejects_invalid_address() {
        assert!(CliArgs::try_parse_from(["seplosbms", "-a", "16", "protocol-version"]).is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_payload() {
        assert!(CliArgs::try_parse_from(["seplosbms", "command", "66", "0G"]).is_err());
    }
}
