// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `uartmq` gateway.
//!
//! This module provides the error hierarchy for failures across the crate:
//! configuration validation, transport communication (serial and MQTT), and
//! device identification.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred during transport communication.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error occurred during device identification.
    #[error("identification error: {0}")]
    Identify(#[from] IdentifyError),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors related to transport communication (MQTT/serial).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// MQTT connection or communication failed.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Serial port operation failed.
    #[error("serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors related to device identification.
///
/// A device announces its type through the `eventType` field of its first
/// parseable JSON frame. These errors cover the ways that announcement can
/// fail to resolve to a configured topic mapping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifyError {
    /// The device announced an event type with no configured mapping.
    #[error("no mapping configured for event type '{event_type}' announced on {port}")]
    UnknownEventType {
        /// Port path the announcement arrived on.
        port: String,
        /// The unrecognized event type string.
        event_type: String,
    },

    /// The device produced no recognizable identity frame in time.
    #[error("device on {port} did not identify within the timeout")]
    Timeout {
        /// Port path of the silent device.
        port: String,
    },
}

/// Errors related to configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `regex:` port rule failed to compile.
    #[error("invalid port rule '{rule}': {source}")]
    InvalidPortRule {
        /// The offending rule as written in the configuration.
        rule: String,
        /// The underlying regex compilation error.
        source: regex::Error,
    },

    /// The configured data bits value is unsupported.
    #[error("unsupported data bits: {0} (expected 5-8)")]
    InvalidDataBits(u8),

    /// The configured stop bits value is unsupported.
    #[error("unsupported stop bits: {0} (expected 1 or 2)")]
    InvalidStopBits(u8),

    /// The frame delimiter is empty.
    #[error("frame delimiter must not be empty")]
    EmptyDelimiter,
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
