// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT boundary of the gateway.
//!
//! The gateway consumes MQTT as a service: it publishes device frames,
//! subscribes to command topics with a callback, and unsubscribes when a
//! device goes away. Delivery ordering, reconnection, and QoS handling
//! belong to the bridge implementation, not to the device-lifecycle core.
//!
//! [`MqttLink`] is the production implementation backed by `rumqttc`. The
//! device handler and manager are generic over [`MqttBridge`] so tests can
//! substitute an in-memory double.

mod mqtt;

pub use mqtt::MqttLink;

use std::future::Future;
use std::sync::Arc;

use crate::error::ProtocolError;

/// Callback invoked for every message delivered on a subscribed topic.
///
/// Receives the topic and the raw payload bytes. Handlers must be cheap and
/// non-blocking; they run on the bridge's event-loop task.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Publish/subscribe surface the gateway requires from an MQTT client.
///
/// The gateway only relies on at-least-once delivery: duplicate forwarding
/// is tolerable, loss is not.
pub trait MqttBridge: Send + Sync + 'static {
    /// Publishes a payload on a topic.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the publish cannot be queued.
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Subscribes to a topic, invoking `handler` for every delivery.
    ///
    /// A second subscription to the same topic replaces the previous
    /// handler.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the subscription cannot be queued.
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Unsubscribes from a topic and drops its handler.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the unsubscription cannot be queued.
    fn unsubscribe(&self, topic: &str) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Disconnects from the broker.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the disconnect fails.
    fn disconnect(&self) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}
