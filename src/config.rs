// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway configuration.
//!
//! All tunables recognized by the gateway live here. The structs deserialize
//! from whatever format the embedding application prefers (TOML, YAML, JSON)
//! via serde; every field has a sensible default so partial configurations
//! work.
//!
//! Interval and timeout fields are stored as milliseconds (matching the
//! `_ms` naming) and exposed as [`Duration`] through accessor methods.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level gateway configuration.
///
/// # Examples
///
/// ```
/// use uartmq::config::{GatewayConfig, TopicMapping};
///
/// let mut config = GatewayConfig::default();
/// config.serial.allowed_ports = vec!["/dev/ttyACM".to_string()];
/// config.mappings.push(TopicMapping {
///     label: None,
///     event_type: "rover-chassis".to_string(),
///     inbound: "cmd/chassis".to_string(),
///     outbound: "telemetry/chassis".to_string(),
/// });
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Service name used in published error reports.
    pub service_name: String,
    /// MQTT topic the gateway publishes error reports on.
    pub error_topic: String,
    /// MQTT broker connection settings.
    pub mqtt: MqttConfig,
    /// Serial line and scanning settings.
    pub serial: SerialConfig,
    /// Device manager cadence and failure-handling settings.
    pub manager: ManagerConfig,
    /// Event-type to topic-pair mappings.
    pub mappings: Vec<TopicMapping>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: "uartmq-gateway".to_string(),
            error_topic: "gateway/errors".to_string(),
            mqtt: MqttConfig::default(),
            serial: SerialConfig::default(),
            manager: ManagerConfig::default(),
            mappings: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Looks up the topic mapping for an announced event type.
    #[must_use]
    pub fn mapping_for(&self, event_type: &str) -> Option<&TopicMapping> {
        self.mappings.iter().find(|m| m.event_type == event_type)
    }

    /// Validates line parameters and the frame delimiter.
    ///
    /// Port rules are validated separately when the port filter is compiled.
    ///
    /// # Errors
    ///
    /// Returns error if data bits, stop bits, or the delimiter are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ConfigError::InvalidDataBits(self.serial.data_bits));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(ConfigError::InvalidStopBits(self.serial.stop_bits));
        }
        if self.serial.delimiter.is_empty() {
            return Err(ConfigError::EmptyDelimiter);
        }
        Ok(())
    }
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional broker username.
    pub username: Option<String>,
    /// Optional broker password.
    pub password: Option<String>,
    /// Client identifier prefix; a random suffix is appended per connection.
    pub client_id: String,
    /// Keep-alive interval in milliseconds.
    pub keepalive_ms: u64,
    /// Maximum time to wait for the broker to acknowledge the connection.
    pub connection_timeout_ms: u64,
    /// Delay before retrying after a connection error.
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "uartmq".to_string(),
            keepalive_ms: 30_000,
            connection_timeout_ms: 10_000,
            reconnect_delay_ms: 5_000,
        }
    }
}

impl MqttConfig {
    /// Returns the keep-alive interval.
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Returns the reconnect delay.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Serial line parameters and port selection rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port selection rules: literal path prefixes, or regular expressions
    /// written as `regex:<pattern>`.
    pub allowed_ports: Vec<String>,
    /// Baud rate for every managed port.
    pub baud_rate: u32,
    /// Data bits (5-8).
    pub data_bits: u8,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Parity setting.
    pub parity: Parity,
    /// Read buffer size in bytes.
    pub buffer_size: usize,
    /// Maximum time to wait for a single serial write to complete.
    pub write_timeout_ms: u64,
    /// Frame delimiter marking message boundaries on the wire.
    pub delimiter: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            allowed_ports: Vec::new(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            buffer_size: 1024,
            write_timeout_ms: 1_000,
            delimiter: "\n".to_string(),
        }
    }
}

impl SerialConfig {
    /// Returns the write timeout.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Returns the frame delimiter as bytes.
    #[must_use]
    pub fn delimiter_bytes(&self) -> &[u8] {
        self.delimiter.as_bytes()
    }
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Even => Self::Even,
            Parity::Odd => Self::Odd,
        }
    }
}

/// Device manager cadence and failure-handling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Interval between port scans.
    pub scan_interval_ms: u64,
    /// Maximum time a scan waits for a pending device to identify itself.
    pub identify_timeout_ms: u64,
    /// Interval between reap passes.
    pub reap_interval_ms: u64,
    /// Maximum silence before a device is presumed dead.
    pub liveness_timeout_ms: u64,
    /// Consecutive identification failures before a port is reported
    /// unhealthy.
    pub failure_threshold: u32,
    /// What to do with ports that keep failing identification.
    pub retry_policy: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 5_000,
            identify_timeout_ms: 5_000,
            reap_interval_ms: 10_000,
            liveness_timeout_ms: 30_000,
            failure_threshold: 5,
            retry_policy: RetryPolicy::Always,
        }
    }
}

impl ManagerConfig {
    /// Returns the scan interval.
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Returns the identification timeout.
    #[must_use]
    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    /// Returns the reap interval.
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Returns the liveness timeout.
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

/// Policy for ports that repeatedly fail identification.
///
/// The failure counter feeds health reporting either way; this only decides
/// whether scanning keeps retrying such ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Keep rescanning failing ports indefinitely; failures only affect
    /// health reporting.
    #[default]
    Always,
    /// Stop attempting ports whose consecutive-failure count has reached the
    /// failure threshold, until the counter clears.
    Exclude,
}

/// Association between an announced device type and its MQTT topic pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicMapping {
    /// Optional human-readable label for logs and documentation.
    #[serde(default)]
    pub label: Option<String>,
    /// Event type string the device announces in its identity frame.
    pub event_type: String,
    /// Topic the gateway subscribes to; payloads are written to the device.
    pub inbound: String,
    /// Topic the gateway republishes device frames on.
    pub outbound: String,
}
