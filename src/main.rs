use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use seplosbms_lib::serialport::SeplosBMS;
use std::{ops::Deref, panic};

mod commandline;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut bms = SeplosBMS::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_address(args.address)?;
    bms.set_timeout(args.timeout);
    bms.set_delay(args.delay);
    bms.set_retry(args.retries);

    match args.command {
        CliCommands::ProtocolVersion => {
            let version = bms
                .get_protocol_version()
                .with_context(|| "Cannot get protocol version")?;
            if args.json {
                println!("{}", serde_json::to_string(&version)?);
            } else {
                println!("Protocol version: {version}");
            }
        }
        CliCommands::Command { function, payload } => {
            let frame = bms
                .command(function, &payload.0)
                .with_context(|| format!("Cannot execute command {function:#04X}"))?;
            if args.json {
                println!("{}", serde_json::to_string(&frame)?);
            } else {
                println!("Status: {} ({:#04X})", frame.status(), frame.function);
                println!("Payload: {:02X?}", frame.payload);
            }
        }
    }

    Ok(())
}
