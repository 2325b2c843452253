// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway facade.
//!
//! Wires the MQTT link, the device manager, and the two periodic passes
//! together behind one connect/shutdown surface.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::manager::{DeviceManager, HealthStatus};
use crate::protocol::{MqttBridge, MqttLink};

/// A running serial-to-MQTT gateway.
///
/// Connecting spawns the scan and reap tasks; the gateway then runs
/// unattended until [`shutdown`](Self::shutdown). Individual device churn
/// never brings it down: per-device faults surface through
/// [`health`](Self::health) and the configured MQTT error topic.
///
/// # Examples
///
/// ```no_run
/// use uartmq::Gateway;
/// use uartmq::config::GatewayConfig;
///
/// #[tokio::main]
/// async fn main() -> uartmq::Result<()> {
///     let mut config = GatewayConfig::default();
///     config.serial.allowed_ports = vec!["/dev/ttyACM".to_string()];
///
///     let gateway = Gateway::connect(config).await?;
///
///     // Run until the embedding application decides to stop.
///     tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
///     gateway.shutdown().await
/// }
/// ```
pub struct Gateway {
    manager: Arc<DeviceManager<MqttLink>>,
    link: MqttLink,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Connects to the MQTT broker and starts the periodic scan and reap
    /// tasks.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the broker
    /// connection fails.
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        let link = MqttLink::connect(&config.mqtt).await.map_err(Error::from)?;
        let manager = Arc::new(DeviceManager::new(config, Arc::new(link.clone()))?);

        let gateway = Self {
            manager,
            link,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        gateway.spawn_tasks();
        Ok(gateway)
    }

    /// Returns the current aggregate health, for exposition by the embedder.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.manager.health_status()
    }

    /// Returns the device manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<DeviceManager<MqttLink>> {
        &self.manager
    }

    /// Stops all device handlers, the periodic tasks, and the broker
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns error if the broker disconnect fails; handlers are stopped
    /// either way.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down gateway");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.manager.stop_all().await;
        self.link.disconnect().await.map_err(Error::from)?;
        Ok(())
    }

    /// Spawns the scan and reap loops at their independent cadences.
    fn spawn_tasks(&self) {
        let scan = self.spawn_periodic(self.manager.config().manager.scan_interval(), Pass::Scan);
        let reap = self.spawn_periodic(self.manager.config().manager.reap_interval(), Pass::Reap);
        self.tasks.lock().extend([scan, reap]);
    }

    fn spawn_periodic(&self, period: Duration, pass: Pass) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => match pass {
                        Pass::Scan => manager.scan().await,
                        Pass::Reap => manager.reap().await,
                    },
                }
            }
        })
    }
}

/// Which periodic pass a spawned loop drives.
#[derive(Debug, Clone, Copy)]
enum Pass {
    Scan,
    Reap,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connected", &self.link.is_connected())
            .field("managed_ports", &self.manager.managed_ports().len())
            .finish_non_exhaustive()
    }
}
