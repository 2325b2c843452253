// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-port device handler.
//!
//! A handler owns exactly one serial port for its lifetime and runs the
//! identification/bridging state machine:
//!
//! ```text
//! IDENTIFYING ──(mapped eventType announced)──▶ CONNECTED ──▶ DISCONNECTED
//!      └───────────────(stop / port loss)─────────────────────────▲
//! ```
//!
//! Attached devices are simple microcontrollers that start streaming without
//! any handshake, so identification is content sniffing: the handler watches
//! inbound frames until one parses as JSON and carries an `eventType` that
//! resolves to a configured topic mapping. Noise and partial frames during
//! that window are expected and non-fatal.
//!
//! Once connected, bridging is verbatim in both directions: device frames
//! are republished on the outbound topic, inbound MQTT payloads are written
//! to the serial line unchanged.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{GatewayConfig, TopicMapping};
use crate::error::{Error, IdentifyError};
use crate::protocol::{MessageHandler, MqttBridge};
use crate::serial::{FrameSplitter, SerialIo, SerialOpener};

/// Lifecycle state of a device handler.
///
/// Transitions are monotone; no state is revisited after `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for the device to announce its type.
    Identifying,
    /// Identified and bridging serial to MQTT.
    Connected,
    /// Stopped. Terminal.
    Disconnected,
}

impl HandlerState {
    /// Returns true while the device type is still unknown.
    #[must_use]
    pub fn is_identifying(&self) -> bool {
        matches!(self, Self::Identifying)
    }

    /// Returns true once the device is bridged.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true once the handler has stopped.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Notification invoked exactly once when a handler stops, carrying the port
/// path so the owner can prune its managed set immediately.
pub type RemovedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Mutable handler state, guarded as one unit so readers always observe a
/// consistent snapshot.
struct HandlerInner {
    state: HandlerState,
    mapping: Option<TopicMapping>,
    last_activity: Instant,
    serial_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// Owns one serial port and bridges it to MQTT once identified.
pub struct DeviceHandler<B> {
    port_path: String,
    config: Arc<GatewayConfig>,
    bridge: Arc<B>,
    inner: Mutex<HandlerInner>,
    /// Written at most once, with the resolved event type.
    event_type_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
    on_removed: RemovedCallback,
}

impl<B: MqttBridge> DeviceHandler<B> {
    /// Creates a handler for `port_path` in the `Identifying` state.
    pub(crate) fn new(
        port_path: String,
        config: Arc<GatewayConfig>,
        bridge: Arc<B>,
        on_removed: RemovedCallback,
    ) -> Arc<Self> {
        let (event_type_tx, _) = watch::channel(None);
        Arc::new(Self {
            port_path,
            config,
            bridge,
            inner: Mutex::new(HandlerInner {
                state: HandlerState::Identifying,
                mapping: None,
                last_activity: Instant::now(),
                serial_tx: None,
            }),
            event_type_tx,
            cancel: CancellationToken::new(),
            on_removed,
        })
    }

    /// Opens the serial port and starts the I/O tasks.
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be opened with the configured line
    /// parameters.
    pub fn start(self: &Arc<Self>, opener: &dyn SerialOpener) -> Result<(), Error> {
        let stream = opener.open(&self.port_path, &self.config.serial)?;
        self.attach(stream);
        Ok(())
    }

    /// Attaches an already-open byte stream and spawns the I/O tasks.
    pub(crate) fn attach<S: SerialIo + 'static>(self: &Arc<Self>, stream: S) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (serial_tx, mut serial_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut inner = self.inner.lock();
            inner.last_activity = Instant::now();
            inner.serial_tx = Some(serial_tx);
        }

        // Writer task: drains MQTT payloads onto the serial line.
        let cancel = self.cancel.clone();
        let write_timeout = self.config.serial.write_timeout();
        let port = self.port_path.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    payload = serial_rx.recv() => {
                        let Some(payload) = payload else { break };
                        match tokio::time::timeout(write_timeout, writer.write_all(&payload)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::warn!(port = %port, error = %e, "Serial write failed");
                            }
                            Err(_) => {
                                tracing::warn!(port = %port, "Serial write timed out");
                            }
                        }
                    }
                }
            }
        });

        // Reader task: recovers frames and drives the state machine. A read
        // error or EOF means the device is gone; the handler evicts itself.
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let mut splitter = FrameSplitter::new(handler.config.serial.delimiter_bytes());
            let mut buf = vec![0u8; handler.config.serial.buffer_size];
            loop {
                tokio::select! {
                    () = handler.cancel.cancelled() => break,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => {
                            tracing::info!(port = %handler.port_path, "Serial port disconnected");
                            handler.stop().await;
                            break;
                        }
                        Ok(n) => {
                            for frame in splitter.push(&buf[..n]) {
                                handler.handle_frame(&frame).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(port = %handler.port_path, error = %e, "Serial read failed");
                            handler.stop().await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Processes one delimited frame from the device.
    async fn handle_frame(self: &Arc<Self>, frame: &[u8]) {
        if frame.is_empty() {
            tracing::trace!(port = %self.port_path, "Ignoring empty frame");
            return;
        }

        // Every inbound frame counts as liveness, identified or not.
        let (state, outbound) = {
            let mut inner = self.inner.lock();
            inner.last_activity = Instant::now();
            (
                inner.state,
                inner.mapping.as_ref().map(|m| m.outbound.clone()),
            )
        };

        match state {
            HandlerState::Disconnected => {}
            HandlerState::Connected => {
                if let Some(topic) = outbound {
                    self.forward(&topic, frame).await;
                }
            }
            HandlerState::Identifying => match self.identify(frame).await {
                // The identity frame itself is forwarded once the bind
                // completes.
                Ok(Some(topic)) => self.forward(&topic, frame).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(port = %self.port_path, error = %e, "Device identification failed");
                }
            },
        }
    }

    /// Attempts to identify the device from a frame.
    ///
    /// Returns `Ok(Some(outbound))` when the frame completed the bind,
    /// `Ok(None)` when the frame is not (yet) identifying data, and an error
    /// when the announced event type has no configured mapping.
    async fn identify(self: &Arc<Self>, frame: &[u8]) -> Result<Option<String>, IdentifyError> {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(frame) else {
            tracing::debug!(port = %self.port_path, "Frame is not JSON, still identifying");
            return Ok(None);
        };
        let Some(event_type) = value.get("eventType").and_then(serde_json::Value::as_str) else {
            tracing::debug!(port = %self.port_path, "Frame carries no eventType field");
            return Ok(None);
        };
        let Some(mapping) = self.config.mapping_for(event_type) else {
            return Err(IdentifyError::UnknownEventType {
                port: self.port_path.clone(),
                event_type: event_type.to_string(),
            });
        };
        let mapping = mapping.clone();

        // Inbound MQTT payloads go straight onto the serial line, raw.
        let serial_tx = self.inner.lock().serial_tx.clone();
        let port = self.port_path.clone();
        let on_message: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
            tracing::debug!(topic = %topic, len = payload.len(), "Writing MQTT payload to serial");
            if let Some(tx) = &serial_tx
                && tx.send(payload.to_vec()).is_err()
            {
                tracing::warn!(port = %port, "Serial writer gone, dropping MQTT payload");
            }
        });

        if let Err(e) = self.bridge.subscribe(&mapping.inbound, on_message).await {
            tracing::warn!(
                port = %self.port_path,
                topic = %mapping.inbound,
                error = %e,
                "Inbound subscription failed, will retry on the next identity frame"
            );
            return Ok(None);
        }

        let outbound = mapping.outbound.clone();
        {
            let mut inner = self.inner.lock();
            if inner.state.is_identifying() {
                inner.mapping = Some(mapping);
                inner.state = HandlerState::Connected;
            }
        }
        let _ = self.event_type_tx.send(Some(event_type.to_string()));
        tracing::info!(
            port = %self.port_path,
            event_type = %event_type,
            "Device identified"
        );

        Ok(Some(outbound))
    }

    /// Republishes a device frame on the outbound topic, best-effort.
    async fn forward(&self, topic: &str, frame: &[u8]) {
        if let Err(e) = self.bridge.publish(topic, frame).await {
            tracing::warn!(
                port = %self.port_path,
                topic = %topic,
                error = %e,
                "Failed to republish device frame"
            );
        }
    }

    /// Stops the handler: unsubscribes the bound inbound topic, closes the
    /// serial resource, transitions to `Disconnected`, and fires the removed
    /// notification.
    ///
    /// Idempotent: concurrent callers race on the state transition and only
    /// the winner performs the side effects.
    pub async fn stop(&self) {
        let mapping = {
            let mut inner = self.inner.lock();
            if inner.state.is_disconnected() {
                return;
            }
            inner.state = HandlerState::Disconnected;
            inner.serial_tx = None;
            inner.mapping.clone()
        };

        self.cancel.cancel();

        if let Some(mapping) = mapping
            && let Err(e) = self.bridge.unsubscribe(&mapping.inbound).await
        {
            tracing::warn!(
                port = %self.port_path,
                topic = %mapping.inbound,
                error = %e,
                "Failed to unsubscribe inbound topic"
            );
        }

        (self.on_removed)(&self.port_path);
        tracing::info!(port = %self.port_path, "Stopped handling device");
    }

    /// Returns the port path this handler owns.
    #[must_use]
    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.inner.lock().state
    }

    /// Returns the resolved event type, if identification has completed.
    #[must_use]
    pub fn event_type(&self) -> Option<String> {
        self.inner
            .lock()
            .mapping
            .as_ref()
            .map(|m| m.event_type.clone())
    }

    /// Returns the instant of the last inbound frame.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Returns a receiver for the one-shot identification signal.
    pub(crate) fn identified_rx(&self) -> watch::Receiver<Option<String>> {
        self.event_type_tx.subscribe()
    }
}

impl<B> std::fmt::Debug for DeviceHandler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeviceHandler")
            .field("port_path", &self.port_path)
            .field("state", &inner.state)
            .field("event_type", &inner.mapping.as_ref().map(|m| &m.event_type))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::RecordingBridge;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn test_config() -> Arc<GatewayConfig> {
        let mut config = GatewayConfig::default();
        config.serial.allowed_ports = vec!["/dev/ttyACM".to_string()];
        config.mappings.push(TopicMapping {
            label: None,
            event_type: "rover-chassis".to_string(),
            inbound: "cmd/chassis".to_string(),
            outbound: "telemetry/chassis".to_string(),
        });
        Arc::new(config)
    }

    fn spawn_handler(
        bridge: &Arc<RecordingBridge>,
        on_removed: RemovedCallback,
    ) -> (Arc<DeviceHandler<RecordingBridge>>, DuplexStream) {
        let (device_side, gateway_side) = tokio::io::duplex(1024);
        let handler = DeviceHandler::new(
            "/dev/ttyACM0".to_string(),
            test_config(),
            Arc::clone(bridge),
            on_removed,
        );
        handler.attach(gateway_side);
        (handler, device_side)
    }

    fn noop_removed() -> RemovedCallback {
        Arc::new(|_| {})
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn identifies_and_binds_on_known_event_type() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());

        device
            .write_all(b"{\"eventType\":\"rover-chassis\"}\n")
            .await
            .unwrap();

        wait_until(|| handler.state().is_connected()).await;
        assert!(bridge.is_subscribed("cmd/chassis"));
        assert_eq!(handler.event_type().as_deref(), Some("rover-chassis"));

        // The identity frame itself is forwarded after the bind.
        wait_until(|| !bridge.published_on("telemetry/chassis").is_empty()).await;
        assert_eq!(
            bridge.published_on("telemetry/chassis")[0],
            b"{\"eventType\":\"rover-chassis\"}".to_vec()
        );
    }

    #[tokio::test]
    async fn identification_signal_fires_once_resolved() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());
        let mut rx = handler.identified_rx();

        device
            .write_all(b"{\"eventType\":\"rover-chassis\"}\n")
            .await
            .unwrap();

        let resolved = tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(Option::is_some),
        )
        .await
        .expect("identification timed out")
        .expect("signal sender dropped");
        assert_eq!(resolved.as_deref(), Some("rover-chassis"));
    }

    #[tokio::test]
    async fn non_json_frame_keeps_identifying() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());

        device.write_all(b"\xfe\xff garbage \x01\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handler.state().is_identifying());
        assert!(!bridge.is_subscribed("cmd/chassis"));
        assert!(bridge.published_on("telemetry/chassis").is_empty());
    }

    #[tokio::test]
    async fn json_without_event_type_keeps_identifying() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());

        device.write_all(b"{\"speed\":10}\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handler.state().is_identifying());
        assert!(bridge.published_on("telemetry/chassis").is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_never_connects() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());

        for _ in 0..3 {
            device
                .write_all(b"{\"eventType\":\"mystery-device\"}\n")
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handler.state().is_identifying());
        assert!(!bridge.is_subscribed("cmd/chassis"));
        assert!(bridge.published_on("telemetry/chassis").is_empty());
    }

    #[tokio::test]
    async fn bind_is_idempotent_across_repeated_identity_frames() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());

        device
            .write_all(b"{\"eventType\":\"rover-chassis\"}\n{\"eventType\":\"rover-chassis\"}\n")
            .await
            .unwrap();

        wait_until(|| bridge.published_on("telemetry/chassis").len() == 2).await;
        assert!(handler.state().is_connected());
        assert_eq!(bridge.subscribe_count("cmd/chassis"), 1);
    }

    #[tokio::test]
    async fn connected_frames_are_forwarded_verbatim() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());

        device
            .write_all(b"{\"eventType\":\"rover-chassis\"}\n")
            .await
            .unwrap();
        wait_until(|| handler.state().is_connected()).await;

        device.write_all(b"{\"speed\":10}\n").await.unwrap();

        wait_until(|| bridge.published_on("telemetry/chassis").len() == 2).await;
        assert_eq!(
            bridge.published_on("telemetry/chassis")[1],
            b"{\"speed\":10}".to_vec()
        );
    }

    #[tokio::test]
    async fn mqtt_payload_is_written_to_serial_verbatim() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());

        device
            .write_all(b"{\"eventType\":\"rover-chassis\"}\n")
            .await
            .unwrap();
        wait_until(|| handler.state().is_connected()).await;

        bridge.inject("cmd/chassis", b"\x01\x02MOVE 10");

        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(1), device.read(&mut buf))
            .await
            .expect("serial write timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"\x01\x02MOVE 10");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let bridge = RecordingBridge::new();
        let removed = Arc::new(AtomicU32::new(0));
        let removed_clone = Arc::clone(&removed);
        let (handler, mut device) = spawn_handler(
            &bridge,
            Arc::new(move |_| {
                removed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        device
            .write_all(b"{\"eventType\":\"rover-chassis\"}\n")
            .await
            .unwrap();
        wait_until(|| handler.state().is_connected()).await;

        tokio::join!(handler.stop(), handler.stop());
        handler.stop().await;

        assert!(handler.state().is_disconnected());
        assert_eq!(bridge.unsubscribe_count("cmd/chassis"), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn evicts_itself_when_the_port_disappears() {
        let bridge = RecordingBridge::new();
        let removed = Arc::new(AtomicU32::new(0));
        let removed_clone = Arc::clone(&removed);
        let (handler, mut device) = spawn_handler(
            &bridge,
            Arc::new(move |_| {
                removed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        device
            .write_all(b"{\"eventType\":\"rover-chassis\"}\n")
            .await
            .unwrap();
        wait_until(|| handler.state().is_connected()).await;

        drop(device);

        wait_until(|| handler.state().is_disconnected()).await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.unsubscribe_count("cmd/chassis"), 1);
    }

    #[tokio::test]
    async fn inbound_frames_refresh_last_activity() {
        let bridge = RecordingBridge::new();
        let (handler, mut device) = spawn_handler(&bridge, noop_removed());
        let before = handler.last_activity();

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.write_all(b"noise\n").await.unwrap();

        wait_until(|| handler.last_activity() > before).await;
        // Garbage refreshes liveness even though it never identifies.
        assert!(handler.state().is_identifying());
    }
}
