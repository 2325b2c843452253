// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `uartmq` - a serial-to-MQTT gateway.
//!
//! This library bridges UART devices to an MQTT pub/sub network. Serial
//! ports are discovered at runtime; the device behind each port is
//! identified purely from the data it emits (simple microcontrollers stream
//! immediately, there is no enumeration protocol), and once identified the
//! device is wired onto its configured MQTT topic pair:
//!
//! - frames the device emits are republished verbatim on the *outbound*
//!   topic;
//! - payloads arriving on the *inbound* topic are written verbatim to the
//!   serial line.
//!
//! Devices that die silently are detected through a liveness timeout, and
//! ports that repeatedly fail identification surface through a degraded
//! health status plus an MQTT error event. The gateway is built to run
//! unattended across individual device churn: no per-device fault crashes
//! the process.
//!
//! # Identification
//!
//! A device announces its type with a JSON frame carrying an `eventType`
//! field, for example:
//!
//! ```json
//! {"eventType": "rover-chassis", "firmware": "1.4.2"}
//! ```
//!
//! Only `eventType` is interpreted; everything else passes through opaque.
//! The event type selects the [`config::TopicMapping`] the device is bound
//! to. Noise, partial frames, and non-JSON data before the announcement are
//! tolerated and retried frame by frame.
//!
//! # Quick Start
//!
//! ```no_run
//! use uartmq::Gateway;
//! use uartmq::config::{GatewayConfig, TopicMapping};
//!
//! #[tokio::main]
//! async fn main() -> uartmq::Result<()> {
//!     let mut config = GatewayConfig::default();
//!     config.serial.allowed_ports = vec![
//!         "/dev/ttyACM".to_string(),
//!         "regex:^/dev/ttyUSB[0-9]+$".to_string(),
//!     ];
//!     config.mappings.push(TopicMapping {
//!         label: Some("chassis".to_string()),
//!         event_type: "rover-chassis".to_string(),
//!         inbound: "cmd/chassis".to_string(),
//!         outbound: "telemetry/chassis".to_string(),
//!     });
//!
//!     let gateway = Gateway::connect(config).await?;
//!
//!     // The gateway now scans, identifies, and bridges on its own.
//!     tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
//!     gateway.shutdown().await
//! }
//! ```
//!
//! # Health
//!
//! ```no_run
//! use uartmq::Gateway;
//! use uartmq::manager::HealthStatus;
//! # async fn example(gateway: &Gateway) {
//! match gateway.health() {
//!     HealthStatus::Healthy => {}
//!     HealthStatus::Degraded { ports } => {
//!         for failure in ports {
//!             eprintln!("{} failed {} times", failure.port, failure.failures);
//!         }
//!     }
//! }
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`manager::DeviceManager`] diffs the host's serial ports against its
//!   managed set on a periodic scan, and reaps dead handlers on an
//!   independent cadence.
//! - [`manager::DeviceHandler`] owns one port and runs the
//!   identification/bridging state machine.
//! - [`protocol::MqttLink`] is the shared broker connection; the core is
//!   generic over [`protocol::MqttBridge`] for testability.
//! - [`serial`] wraps port enumeration, port opening, and delimiter
//!   framing.

pub mod config;
pub mod error;
pub mod filter;
mod gateway;
pub mod manager;
pub mod protocol;
pub mod serial;

pub use error::{Error, Result};
pub use gateway::Gateway;
