// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device manager: discovery, reconciliation, and failure accounting.
//!
//! The manager owns the set of active device handlers and runs two
//! independent periodic passes against it:
//!
//! - **scan**: enumerate ports, start handlers for newly eligible ones,
//!   drop handlers whose port vanished, and wait (bounded, concurrently)
//!   for pending identifications.
//! - **reap**: remove handlers that are disconnected or have gone silent
//!   past the liveness timeout.
//!
//! Scan and reap deliberately stay separate tasks: their cadences, timeouts
//! and failure semantics differ, and they coordinate only through the
//! guarded managed set and per-handler state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::task::JoinSet;

use crate::config::{GatewayConfig, RetryPolicy};
use crate::error::{Error, IdentifyError};
use crate::filter::PortFilter;
use crate::protocol::MqttBridge;
use crate::serial::{PortInfo, PortSource, SerialOpener, SystemPortSource, SystemSerialOpener};

use super::device_handler::{DeviceHandler, RemovedCallback};
use super::health::{HealthReporter, HealthStatus};

/// Coordinates the lifecycle of all serial devices on the host.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use uartmq::config::GatewayConfig;
/// use uartmq::manager::DeviceManager;
/// use uartmq::protocol::MqttLink;
///
/// # async fn example() -> uartmq::Result<()> {
/// let config = GatewayConfig::default();
/// let link = Arc::new(MqttLink::connect(&config.mqtt).await?);
/// let manager = DeviceManager::new(config, link)?;
///
/// // One discovery pass; normally driven by the gateway's scan task.
/// manager.scan().await;
/// # Ok(())
/// # }
/// ```
pub struct DeviceManager<B> {
    config: Arc<GatewayConfig>,
    bridge: Arc<B>,
    filter: PortFilter,
    port_source: Arc<dyn PortSource>,
    opener: Arc<dyn SerialOpener>,
    /// Managed handlers by port path. Shared with the scan task, the reap
    /// task, and every handler's removed-notification.
    handlers: Arc<RwLock<HashMap<String, Arc<DeviceHandler<B>>>>>,
    health: Arc<HealthReporter<B>>,
}

impl<B: MqttBridge> DeviceManager<B> {
    /// Creates a manager over the host's real serial ports.
    ///
    /// The port filter is compiled here, once, from the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration or a port rule is invalid.
    pub fn new(config: GatewayConfig, bridge: Arc<B>) -> Result<Self, Error> {
        config.validate()?;
        let filter = PortFilter::compile(&config.serial.allowed_ports)?;
        if filter.is_empty() {
            tracing::warn!("No port rules configured; the gateway will manage no devices");
        }

        let config = Arc::new(config);
        let health = Arc::new(HealthReporter::new(&config, Arc::clone(&bridge)));

        Ok(Self {
            config,
            bridge,
            filter,
            port_source: Arc::new(SystemPortSource),
            opener: Arc::new(SystemSerialOpener),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            health,
        })
    }

    /// Replaces the port source (for embedders and tests).
    #[must_use]
    pub fn with_port_source(mut self, source: Arc<dyn PortSource>) -> Self {
        self.port_source = source;
        self
    }

    /// Replaces the serial opener (for embedders and tests).
    #[must_use]
    pub fn with_serial_opener(mut self, opener: Arc<dyn SerialOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Returns the gateway configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Returns the health reporter.
    #[must_use]
    pub fn health(&self) -> Arc<HealthReporter<B>> {
        Arc::clone(&self.health)
    }

    /// Returns the current health status.
    #[must_use]
    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    /// Returns the paths of all currently managed ports.
    #[must_use]
    pub fn managed_ports(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Returns the handler for a port, if managed.
    #[must_use]
    pub fn handler(&self, port_path: &str) -> Option<Arc<DeviceHandler<B>>> {
        self.handlers.read().get(port_path).cloned()
    }

    /// One discovery pass: start handlers for newly eligible ports, drop
    /// handlers for vanished ports, then wait (bounded) for every pending
    /// identification.
    pub async fn scan(&self) {
        tracing::debug!("Scanning for serial devices");
        let available = self.port_source.list_ports();
        let threshold = self.config.manager.failure_threshold;

        for port in available.iter().filter(|p| self.filter.matches(&p.path)) {
            if self.handlers.read().contains_key(&port.path) {
                continue;
            }
            if self.config.manager.retry_policy == RetryPolicy::Exclude
                && self.health.consecutive_failures(&port.path) >= threshold
            {
                tracing::debug!(
                    port = %port.path,
                    "Skipping port after repeated identification failures"
                );
                continue;
            }
            self.start_handler(port).await;
        }

        self.remove_vanished(&available).await;
        self.await_identifications().await;
    }

    /// One reap pass: remove handlers that are disconnected or have gone
    /// silent past the liveness timeout.
    pub async fn reap(&self) {
        tracing::debug!("Reaping dead device handlers");
        let liveness = self.config.manager.liveness_timeout();
        let now = Instant::now();

        let dead: Vec<Arc<DeviceHandler<B>>> = {
            let mut handlers = self.handlers.write();
            let expired: Vec<String> = handlers
                .iter()
                .filter(|(_, h)| {
                    h.state().is_disconnected()
                        || now.duration_since(h.last_activity()) > liveness
                })
                .map(|(path, _)| path.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|path| handlers.remove(&path))
                .collect()
        };

        for handler in dead {
            tracing::info!(
                port = %handler.port_path(),
                state = ?handler.state(),
                "Removing dead device handler"
            );
            handler.stop().await;
            self.health.clear(handler.port_path());
        }
    }

    /// Stops and removes every managed handler.
    pub async fn stop_all(&self) {
        let all: Vec<Arc<DeviceHandler<B>>> = {
            let mut handlers = self.handlers.write();
            handlers.drain().map(|(_, h)| h).collect()
        };
        for handler in all {
            handler.stop().await;
        }
    }

    /// Creates, registers, and starts a handler for a newly eligible port.
    async fn start_handler(&self, port: &PortInfo) {
        let handlers_weak = Arc::downgrade(&self.handlers);
        let on_removed: RemovedCallback = Arc::new(move |path: &str| {
            if let Some(handlers) = handlers_weak.upgrade() {
                handlers.write().remove(path);
            }
        });

        let handler = DeviceHandler::new(
            port.path.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.bridge),
            on_removed,
        );

        // Registered before the port is opened so a concurrent scan cannot
        // double-start it.
        self.handlers
            .write()
            .insert(port.path.clone(), Arc::clone(&handler));

        match handler.start(self.opener.as_ref()) {
            Ok(()) => {
                tracing::info!(port = %port.path, name = %port.name, "Started handling device");
            }
            Err(e) => {
                tracing::warn!(port = %port.path, error = %e, "Failed to open serial port");
                self.handlers.write().remove(&port.path);
                self.health.record_failure(&port.path).await;
            }
        }
    }

    /// Drops handlers whose port no longer appears in the host enumeration.
    async fn remove_vanished(&self, available: &[PortInfo]) {
        let available_paths: HashSet<&str> =
            available.iter().map(|p| p.path.as_str()).collect();

        let vanished: Vec<Arc<DeviceHandler<B>>> = {
            let mut handlers = self.handlers.write();
            let gone: Vec<String> = handlers
                .keys()
                .filter(|path| !available_paths.contains(path.as_str()))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|path| handlers.remove(&path))
                .collect()
        };

        for handler in vanished {
            tracing::info!(port = %handler.port_path(), "Port no longer present, stopping handler");
            handler.stop().await;
            self.health.clear(handler.port_path());
        }
    }

    /// Waits for every handler still identifying, each bounded by the
    /// identification timeout, all concurrently so one silent device cannot
    /// stall the rest of the scan.
    async fn await_identifications(&self) {
        let (pending, resolved): (Vec<Arc<DeviceHandler<B>>>, Vec<Arc<DeviceHandler<B>>>) = self
            .handlers
            .read()
            .values()
            .cloned()
            .partition(|h| h.state().is_identifying());

        // Handlers that identified between scans recover their port's health.
        for handler in resolved.iter().filter(|h| h.state().is_connected()) {
            self.health.clear(handler.port_path());
        }

        if pending.is_empty() {
            return;
        }

        let timeout = self.config.manager.identify_timeout();
        let mut waits = JoinSet::new();
        for handler in pending {
            let mut rx = handler.identified_rx();
            let port = handler.port_path().to_string();
            waits.spawn(async move {
                match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
                    Ok(Ok(resolved)) => {
                        let event_type = (*resolved).clone();
                        (port, event_type)
                    }
                    _ => (port, None),
                }
            });
        }

        while let Some(result) = waits.join_next().await {
            let Ok((port, outcome)) = result else {
                continue;
            };
            match outcome {
                Some(event_type) => {
                    tracing::debug!(port = %port, event_type = %event_type, "Identification resolved");
                    self.health.clear(&port);
                }
                None => {
                    let err = IdentifyError::Timeout { port: port.clone() };
                    tracing::warn!(port = %port, error = %err, "Identification did not complete");
                    self.health.record_failure(&port).await;
                }
            }
        }
    }
}

impl<B> std::fmt::Debug for DeviceManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("managed_ports", &self.handlers.read().len())
            .finish_non_exhaustive()
    }
}
