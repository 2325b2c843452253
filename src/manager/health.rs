// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identification-failure aggregation and degraded-health reporting.
//!
//! The manager feeds consecutive identification failures per port into the
//! [`HealthReporter`]. When any port's count exceeds the configured
//! threshold, the gateway is degraded: the transition is logged and a
//! structured error event is published on the error topic, best-effort.
//! Reporting a problem must never itself be able to fail the gateway, so
//! serialization or publish errors are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::GatewayConfig;
use crate::protocol::MqttBridge;

/// Aggregate health of the gateway, derived from per-port failure counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// No port has exceeded the failure threshold.
    Healthy,
    /// At least one port keeps failing identification.
    Degraded {
        /// The offending ports with their consecutive-failure counts.
        ports: Vec<PortFailures>,
    },
}

impl HealthStatus {
    /// Returns true when no port has exceeded the failure threshold.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// One offending port in a degraded-health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortFailures {
    /// Port path.
    pub port: String,
    /// Consecutive identification failures.
    pub failures: u32,
}

/// Error event published on the configured error topic.
#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    service: &'a str,
    category: &'a str,
    ports: &'a [PortFailures],
    timestamp: DateTime<Utc>,
}

/// Tracks consecutive identification failures per port and publishes a
/// degraded-health event when a port crosses the threshold.
pub struct HealthReporter<B> {
    service: String,
    error_topic: String,
    threshold: u32,
    bridge: Arc<B>,
    failures: Mutex<HashMap<String, u32>>,
    degraded: AtomicBool,
}

impl<B: MqttBridge> HealthReporter<B> {
    /// Creates a reporter from the gateway configuration.
    pub(crate) fn new(config: &GatewayConfig, bridge: Arc<B>) -> Self {
        Self {
            service: config.service_name.clone(),
            error_topic: config.error_topic.clone(),
            threshold: config.manager.failure_threshold,
            bridge,
            failures: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Records one identification failure for a port.
    ///
    /// On the healthy-to-degraded transition, publishes an error event on
    /// the error topic, best-effort.
    pub async fn record_failure(&self, port: &str) {
        let offending = {
            let mut failures = self.failures.lock();
            let count = failures.entry(port.to_string()).or_insert(0);
            *count += 1;
            tracing::debug!(port = %port, failures = *count, "Recorded identification failure");
            offending_ports(&failures, self.threshold)
        };

        if !offending.is_empty() && !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::error!(ports = ?offending, "Repeated identification failures detected");
            self.publish_report(&offending).await;
        }
    }

    /// Clears a port's failure count (identification succeeded or the
    /// handler was removed).
    pub fn clear(&self, port: &str) {
        let mut failures = self.failures.lock();
        if failures.remove(port).is_none() {
            return;
        }
        tracing::debug!(port = %port, "Cleared identification failures");
        if offending_ports(&failures, self.threshold).is_empty() {
            self.degraded.store(false, Ordering::Release);
        }
    }

    /// Returns the consecutive-failure count for a port.
    #[must_use]
    pub fn consecutive_failures(&self, port: &str) -> u32 {
        self.failures.lock().get(port).copied().unwrap_or(0)
    }

    /// Returns the current aggregate health.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        let offending = offending_ports(&self.failures.lock(), self.threshold);
        if offending.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded { ports: offending }
        }
    }

    /// Publishes an error event, best-effort.
    async fn publish_report(&self, ports: &[PortFailures]) {
        let report = ErrorReport {
            service: &self.service,
            category: "deviceConnectionError",
            ports,
            timestamp: Utc::now(),
        };
        match serde_json::to_vec(&report) {
            Ok(payload) => {
                if let Err(e) = self.bridge.publish(&self.error_topic, &payload).await {
                    tracing::error!(
                        topic = %self.error_topic,
                        error = %e,
                        "Failed to publish error report"
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot serialize error report");
            }
        }
    }
}

impl<B> std::fmt::Debug for HealthReporter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthReporter")
            .field("threshold", &self.threshold)
            .field("tracked_ports", &self.failures.lock().len())
            .field("degraded", &self.degraded.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Ports whose consecutive-failure count exceeds the threshold, sorted for
/// stable report output.
fn offending_ports(failures: &HashMap<String, u32>, threshold: u32) -> Vec<PortFailures> {
    let mut ports: Vec<PortFailures> = failures
        .iter()
        .filter(|(_, count)| **count > threshold)
        .map(|(port, count)| PortFailures {
            port: port.clone(),
            failures: *count,
        })
        .collect();
    ports.sort_by(|a, b| a.port.cmp(&b.port));
    ports
}
