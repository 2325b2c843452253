// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial transport adapter.
//!
//! This module wraps the host's serial facilities behind two narrow seams:
//!
//! - [`PortSource`]: enumerates the serial ports currently present on the
//!   host. The production implementation ([`SystemPortSource`]) asks the OS;
//!   tests substitute a scripted source.
//! - [`SerialOpener`]: opens a port with the configured line parameters and
//!   hands back an async byte stream. The production implementation
//!   ([`SystemSerialOpener`]) opens a real [`tokio_serial::SerialStream`];
//!   tests substitute in-memory duplex pipes.
//!
//! Frame boundaries are recovered by [`FrameSplitter`].

mod framing;

pub use framing::FrameSplitter;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use crate::config::SerialConfig;
use crate::error::{ConfigError, Error, ProtocolError};

/// Snapshot of one serial port present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Stable OS path of the port (e.g. `/dev/ttyACM0`).
    pub path: String,
    /// Short display name (the path's file name).
    pub name: String,
}

impl PortInfo {
    /// Creates a port descriptor from an OS port path.
    #[must_use]
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .rsplit('/')
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        Self { path, name }
    }
}

/// Enumerates the serial ports currently present on the host.
///
/// Purely descriptive: listing ports has no side effects.
pub trait PortSource: Send + Sync {
    /// Returns a snapshot of the currently available ports.
    fn list_ports(&self) -> Vec<PortInfo>;
}

/// [`PortSource`] backed by the operating system's port enumeration.
#[derive(Debug, Default)]
pub struct SystemPortSource;

impl PortSource for SystemPortSource {
    fn list_ports(&self) -> Vec<PortInfo> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| PortInfo::from_path(p.port_name))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to enumerate serial ports");
                Vec::new()
            }
        }
    }
}

/// Object-safe alias for an async serial byte stream.
///
/// Satisfied by [`tokio_serial::SerialStream`] in production and by
/// `tokio::io::DuplexStream` in tests.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

/// Opens serial ports with configured line parameters.
pub trait SerialOpener: Send + Sync {
    /// Opens the port at `path` and returns its byte stream.
    ///
    /// # Errors
    ///
    /// Returns error if the line parameters are invalid or the port cannot
    /// be opened.
    fn open(&self, path: &str, config: &SerialConfig) -> Result<Box<dyn SerialIo>, Error>;
}

/// [`SerialOpener`] backed by real host serial ports.
#[derive(Debug, Default)]
pub struct SystemSerialOpener;

impl SerialOpener for SystemSerialOpener {
    fn open(&self, path: &str, config: &SerialConfig) -> Result<Box<dyn SerialIo>, Error> {
        let stream = tokio_serial::new(path, config.baud_rate)
            .data_bits(data_bits(config.data_bits)?)
            .stop_bits(stop_bits(config.stop_bits)?)
            .parity(config.parity.into())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(ProtocolError::Serial)?;
        Ok(Box::new(stream))
    }
}

fn data_bits(bits: u8) -> Result<tokio_serial::DataBits, ConfigError> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(ConfigError::InvalidDataBits(other)),
    }
}

fn stop_bits(bits: u8) -> Result<tokio_serial::StopBits, ConfigError> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(ConfigError::InvalidStopBits(other)),
    }
}
