#![cfg_attr(docsrs, feature(doc_cfg))]
//! # seplosbms_lib
//!
//! This crate provides a library for talking to Seplos BMS (Battery Management System) devices
//! using the ASCII framed "protocol 2.0" over RS485.
//!
//! The frame codec ([`protocol`]) and the transaction engine ([`transaction`]) are always
//! available. Serial clients are enabled through features.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `seplosbms` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** client using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing decoded frames.
//! - `bin-dependencies`: Enables all features required by the `seplosbms` binary executable.

/// ASCII frame checksums.
pub mod checksum;
/// Contains error types for the library.
mod error;
/// Hex-ASCII field encoding.
pub mod hex;
/// Defines the frame format of the Seplos protocol.
pub mod protocol;
/// Single request/response exchanges over an abstract channel.
pub mod transaction;

pub use error::{Error, Result};

/// Synchronous client for Seplos BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous client for Seplos BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
