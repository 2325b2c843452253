// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `rumqttc`-backed MQTT bridge.
//!
//! A single broker connection is shared by every device handler. Incoming
//! publishes are routed to the handler registered for their exact topic.
//! The background event loop keeps polling after connection errors, which
//! lets `rumqttc` re-establish the session; subscriptions are re-issued on
//! every connection acknowledgment so devices keep receiving commands
//! across broker restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::error::ProtocolError;

use super::{MessageHandler, MqttBridge};

/// MQTT bridge backed by a persistent `rumqttc` connection.
///
/// `MqttLink` is cheaply cloneable (via `Arc`) and shared between all device
/// handlers of a gateway.
///
/// # Examples
///
/// ```no_run
/// use uartmq::config::MqttConfig;
/// use uartmq::protocol::MqttLink;
///
/// # async fn example() -> uartmq::Result<()> {
/// let config = MqttConfig::default();
/// let link = MqttLink::connect(&config).await?;
/// assert!(link.is_connected());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqttLink {
    inner: Arc<MqttLinkInner>,
}

struct MqttLinkInner {
    /// The MQTT async client for publishing and subscribing.
    client: AsyncClient,
    /// Message handlers by exact subscribed topic.
    handlers: RwLock<HashMap<String, MessageHandler>>,
    /// Connection status.
    connected: AtomicBool,
    /// Set once `disconnect` has been requested; stops the event loop.
    closed: AtomicBool,
    /// Delay before retrying after an event-loop error.
    reconnect_delay: std::time::Duration,
}

impl MqttLink {
    /// Connects to the broker described by `config`.
    ///
    /// The client identifier is the configured prefix plus a random suffix,
    /// so multiple gateway instances can share a broker.
    ///
    /// # Errors
    ///
    /// Returns error if the broker does not acknowledge the connection
    /// within the configured timeout.
    pub async fn connect(config: &MqttConfig) -> Result<Self, ProtocolError> {
        let client_id = unique_client_id(&config.client_id);

        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(config.keepalive());
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 64);

        let link = Self {
            inner: Arc::new(MqttLinkInner {
                client,
                handlers: RwLock::new(HashMap::new()),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reconnect_delay: config.reconnect_delay(),
            }),
        };

        // Channel to signal when ConnAck is received
        let (connack_tx, connack_rx) = oneshot::channel();

        let link_clone = link.clone();
        tokio::spawn(async move {
            handle_link_events(event_loop, link_clone, Some(connack_tx)).await;
        });

        let timeout = config.connection_timeout();
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                tracing::info!(
                    host = %config.host,
                    port = config.port,
                    client_id = %client_id,
                    "Connected to MQTT broker"
                );
                Ok(link)
            }
            Ok(Err(_)) => {
                link.inner.closed.store(true, Ordering::Release);
                Err(ProtocolError::ConnectionFailed(
                    "MQTT event loop terminated unexpectedly".to_string(),
                ))
            }
            Err(_) => {
                link.inner.closed.store(true, Ordering::Release);
                Err(ProtocolError::ConnectionFailed(format!(
                    "MQTT connection timeout after {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Returns whether the broker connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Routes an incoming publish to the handler registered for its topic.
    fn route(&self, topic: &str, payload: &[u8]) {
        let handler = self.inner.handlers.read().get(topic).cloned();
        match handler {
            Some(handler) => handler(topic, payload),
            None => tracing::trace!(topic = %topic, "No handler registered for topic"),
        }
    }

    /// Re-issues every active subscription after a reconnect.
    async fn resubscribe_all(&self) {
        let topics: Vec<String> = self.inner.handlers.read().keys().cloned().collect();
        for topic in topics {
            if let Err(e) = self.inner.client.subscribe(&topic, QoS::AtLeastOnce).await {
                tracing::warn!(topic = %topic, error = %e, "Failed to restore subscription");
            }
        }
    }
}

impl MqttBridge for MqttLink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), ProtocolError> {
        tracing::debug!(topic = %topic, len = payload.len(), "Publishing MQTT message");
        self.inner
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), ProtocolError> {
        tracing::debug!(topic = %topic, "Subscribing to MQTT topic");
        self.inner
            .handlers
            .write()
            .insert(topic.to_string(), handler);
        self.inner
            .client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        tracing::debug!(topic = %topic, "Unsubscribing from MQTT topic");
        self.inner.handlers.write().remove(topic);
        self.inner
            .client
            .unsubscribe(topic)
            .await
            .map_err(ProtocolError::Mqtt)
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        tracing::info!("Disconnecting from MQTT broker");
        self.inner.closed.store(true, Ordering::Release);
        self.inner.handlers.write().clear();
        self.inner
            .client
            .disconnect()
            .await
            .map_err(ProtocolError::Mqtt)?;
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for MqttLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttLink")
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.inner.handlers.read().len())
            .finish()
    }
}

/// Generates a unique client identifier from the configured prefix.
fn unique_client_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Handles MQTT events for the link's lifetime.
async fn handle_link_events(
    mut event_loop: EventLoop,
    link: MqttLink,
    mut connack_tx: Option<oneshot::Sender<()>>,
) {
    use rumqttc::{Event, Packet};

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if link.inner.closed.load(Ordering::Acquire) {
                    break;
                }
                tracing::debug!(?connack, "MQTT connected");
                link.inner.connected.store(true, Ordering::Release);
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
                link.resubscribe_all().await;
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                link.route(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker requested disconnect");
                link.inner.connected.store(false, Ordering::Release);
            }
            Ok(_) => {}
            Err(e) => {
                link.inner.connected.store(false, Ordering::Release);
                if link.inner.closed.load(Ordering::Acquire) {
                    tracing::debug!("MQTT event loop stopped after disconnect");
                    break;
                }
                tracing::error!(error = %e, "MQTT event loop error, retrying");
                tokio::time::sleep(link.inner.reconnect_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_keeps_prefix() {
        let id = unique_client_id("uartmq");
        assert!(id.starts_with("uartmq-"));
        assert!(id.len() > "uartmq-".len());
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(unique_client_id("uartmq"), unique_client_id("uartmq"));
    }
}
