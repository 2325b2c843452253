// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the MQTT link using mockforge-mqtt.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mockforge_mqtt::broker::MqttConfig as BrokerConfig;
use mockforge_mqtt::start_mqtt_server;
use tokio::time::sleep;
use uartmq::config::MqttConfig;
use uartmq::protocol::{MessageHandler, MqttBridge, MqttLink};

/// Helper to find an available port for testing.
fn get_test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(18870);
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Starts a mock MQTT broker on the given port.
async fn start_mock_broker(port: u16) {
    let config = BrokerConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..Default::default()
    };

    tokio::spawn(async move {
        let _ = start_mqtt_server(config).await;
    });

    // Give the broker time to start, bind to port, and be ready to accept connections
    sleep(Duration::from_millis(500)).await;
}

fn link_config(port: u16) -> MqttConfig {
    MqttConfig {
        host: "127.0.0.1".to_string(),
        port,
        connection_timeout_ms: 3_000,
        reconnect_delay_ms: 200,
        ..Default::default()
    }
}

/// Collects deliveries so tests can assert on them.
fn collecting_handler() -> (MessageHandler, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
    let received: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    let handler: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
        received_clone
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
    });
    (handler, received)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..60 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

// ============================================================================
// Connection Tests
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn connect_to_broker() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let result = MqttLink::connect(&link_config(port)).await;

        assert!(result.is_ok(), "Failed to connect: {:?}", result.err());
        assert!(result.unwrap().is_connected());
    }

    #[tokio::test]
    async fn connect_to_unreachable_broker_fails() {
        let port = get_test_port();
        // No broker started on this port.
        let mut config = link_config(port);
        config.connection_timeout_ms = 800;

        let result = MqttLink::connect(&config).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disconnect_clears_connected_flag() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let link = MqttLink::connect(&link_config(port)).await.unwrap();
        assert!(link.is_connected());

        link.disconnect().await.unwrap();
        assert!(!link.is_connected());
    }
}

// ============================================================================
// Publish / Subscribe Tests
// ============================================================================

mod pubsub {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_payload_verbatim() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let link = MqttLink::connect(&link_config(port)).await.unwrap();
        let (handler, received) = collecting_handler();

        link.subscribe("cmd/chassis", handler).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        link.publish("cmd/chassis", b"{\"speed\":10}").await.unwrap();

        let delivered = wait_until(|| !received.lock().unwrap().is_empty()).await;
        assert!(delivered, "message was not delivered");

        let received = received.lock().unwrap();
        assert_eq!(received[0].0, "cmd/chassis");
        assert_eq!(received[0].1, b"{\"speed\":10}".to_vec());
    }

    #[tokio::test]
    async fn messages_route_to_their_own_topic_handler() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let link = MqttLink::connect(&link_config(port)).await.unwrap();
        let (chassis_handler, chassis_received) = collecting_handler();
        let (arm_handler, arm_received) = collecting_handler();

        link.subscribe("cmd/chassis", chassis_handler).await.unwrap();
        link.subscribe("cmd/arm", arm_handler).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        link.publish("cmd/arm", b"grip").await.unwrap();

        let delivered = wait_until(|| !arm_received.lock().unwrap().is_empty()).await;
        assert!(delivered, "message was not delivered");
        assert!(chassis_received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let link = MqttLink::connect(&link_config(port)).await.unwrap();
        let (handler, received) = collecting_handler();

        link.subscribe("cmd/chassis", handler).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        link.publish("cmd/chassis", b"first").await.unwrap();
        let delivered = wait_until(|| received.lock().unwrap().len() == 1).await;
        assert!(delivered, "first message was not delivered");

        link.unsubscribe("cmd/chassis").await.unwrap();
        sleep(Duration::from_millis(300)).await;

        link.publish("cmd/chassis", b"second").await.unwrap();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn binary_payload_survives_the_round_trip() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let link = MqttLink::connect(&link_config(port)).await.unwrap();
        let (handler, received) = collecting_handler();

        link.subscribe("cmd/raw", handler).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        let payload: Vec<u8> = vec![0x00, 0x01, 0xfe, 0xff, b'\n', 0x7f];
        link.publish("cmd/raw", &payload).await.unwrap();

        let delivered = wait_until(|| !received.lock().unwrap().is_empty()).await;
        assert!(delivered, "message was not delivered");
        assert_eq!(received.lock().unwrap()[0].1, payload);
    }
}
