//! Thin device-client facade over rumqttc.
//!
//! Transport, reconnection and keep-alive are owned by rumqttc; this layer
//! only shapes topics and payload envelopes, tracks connectivity, and turns
//! transport events into [`DeviceEvents`] lifecycle calls. The transport is
//! polled on its own task so the broker connection stays alive even while a
//! lifecycle handler runs a long send loop; lifecycle events themselves are
//! dispatched strictly one at a time, so such a handler blocks every later
//! event until it returns.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::interface::{Interface, Ownership, Reliability};

/// Incoming data on a registered interface, already decoded from the wire.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub interface: String,
    pub path: String,
    pub value: Value,
}

/// Lifecycle hooks invoked by [`DeviceClient::run`].
///
/// `on_connected` may return `ControlFlow::Break` to stop the dispatch loop
/// and with it the whole process.
#[async_trait]
pub trait DeviceEvents: Send {
    async fn on_connected(&mut self, device: &DeviceClient) -> Result<ControlFlow<()>> {
        let _ = device;
        Ok(ControlFlow::Continue(()))
    }

    async fn on_disconnected(&mut self) {}

    async fn on_data_received(&mut self, event: DataEvent) {
        let _ = event;
    }

    async fn on_aggregate_data_received(&mut self, event: DataEvent) {
        let _ = event;
    }
}

/// The publish surface the telemetry loop runs against. Split out from
/// [`DeviceClient`] so the loop can be driven by a scripted double in tests.
#[async_trait]
pub trait DeviceConnection {
    fn is_connected(&self) -> bool;

    async fn send_aggregate(
        &self,
        interface: &str,
        path: &str,
        value: Value,
        timestamp: i64,
    ) -> Result<()>;
}

enum DeviceEvent {
    Connected,
    Disconnected,
    Publish { topic: String, payload: Vec<u8> },
}

pub struct DeviceClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    base_topic: String,
    interfaces: HashMap<String, Interface>,
}

impl DeviceClient {
    /// Build the client plus the transport event loop it is driven by, the
    /// same pairing rumqttc itself hands out.
    pub fn new(config: &Config) -> Result<(Self, EventLoop)> {
        let (host, port) = config.broker_addr()?;
        let mut options = MqttOptions::new(config.device_id.clone(), host, port);
        options.set_credentials(config.device_id.clone(), config.device_secret.clone());
        options.set_keep_alive(Duration::from_secs(30));

        let (client, event_loop) = AsyncClient::new(options, 16);
        let device = DeviceClient {
            client,
            connected: Arc::new(AtomicBool::new(false)),
            base_topic: format!("{}/{}", config.realm_name, config.device_id),
            interfaces: HashMap::new(),
        };
        Ok((device, event_loop))
    }

    /// Register an interface descriptor. Must happen before [`Self::run`];
    /// data can only be sent on registered interfaces.
    pub fn add_interface(&mut self, interface: Interface) -> Result<()> {
        let name = interface.interface_name.clone();
        if self.interfaces.insert(name.clone(), interface).is_some() {
            bail!("interface {name} registered twice");
        }
        Ok(())
    }

    /// Connect and dispatch lifecycle events to `handler` until it signals
    /// stop. The underlying transport reconnects on its own; every
    /// established session fires `on_connected` again.
    pub async fn run<H: DeviceEvents>(
        &mut self,
        event_loop: EventLoop,
        handler: &mut H,
    ) -> Result<()> {
        let mut events = spawn_transport(event_loop, Arc::clone(&self.connected));

        while let Some(event) = events.recv().await {
            match event {
                DeviceEvent::Connected => {
                    self.subscribe_server_interfaces().await?;
                    if handler.on_connected(self).await?.is_break() {
                        break;
                    }
                }
                DeviceEvent::Disconnected => handler.on_disconnected().await,
                DeviceEvent::Publish { topic, payload } => {
                    match parse_publish(&self.base_topic, &topic, &payload) {
                        Some(event) if event.value.is_object() => {
                            handler.on_aggregate_data_received(event).await
                        }
                        Some(event) => handler.on_data_received(event).await,
                        None => debug!("ignoring publish on unexpected topic {topic}"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe_server_interfaces(&self) -> Result<()> {
        for interface in self.interfaces.values() {
            if interface.ownership != Ownership::Server {
                continue;
            }
            let filter = format!("{}/{}/#", self.base_topic, interface.interface_name);
            self.client
                .subscribe(&filter, QoS::AtLeastOnce)
                .await
                .with_context(|| format!("failed to subscribe to {filter}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceConnection for DeviceClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_aggregate(
        &self,
        interface: &str,
        path: &str,
        value: Value,
        timestamp: i64,
    ) -> Result<()> {
        let descriptor = self
            .interfaces
            .get(interface)
            .with_context(|| format!("interface {interface} is not registered"))?;
        let topic = publish_topic(&self.base_topic, interface, path);
        let payload = serde_json::to_vec(&wire_envelope(value, timestamp))?;
        self.client
            .publish(&topic, publish_qos(descriptor), false, payload)
            .await
            .with_context(|| format!("failed to publish on {topic}"))?;
        Ok(())
    }
}

/// Drives the rumqttc event loop on its own task, keeping the connectivity
/// flag current and forwarding lifecycle events. The channel is unbounded so
/// a slow event handler never stalls the transport.
fn spawn_transport(
    mut event_loop: EventLoop,
    connected: Arc<AtomicBool>,
) -> mpsc::UnboundedReceiver<DeviceEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("broker session established");
                    connected.store(true, Ordering::SeqCst);
                    if tx.send(DeviceEvent::Connected).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let event = DeviceEvent::Publish {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        warn!("broker connection lost: {err}");
                        if tx.send(DeviceEvent::Disconnected).is_err() {
                            break;
                        }
                    } else {
                        error!("broker connection failed: {err}");
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
    rx
}

fn publish_topic(base_topic: &str, interface: &str, path: &str) -> String {
    format!("{base_topic}/{interface}{path}")
}

/// Astarte data envelope: the value under `v`, the submission timestamp
/// (seconds since epoch) under `t`.
fn wire_envelope(value: Value, timestamp: i64) -> Value {
    json!({ "v": value, "t": timestamp })
}

/// Reliability of the descriptor's mappings decides the MQTT QoS level.
fn publish_qos(interface: &Interface) -> QoS {
    match interface.mappings.first().map(|m| m.reliability) {
        Some(Reliability::Unreliable) => QoS::AtMostOnce,
        Some(Reliability::Guaranteed) => QoS::AtLeastOnce,
        Some(Reliability::Unique) => QoS::ExactlyOnce,
        None => QoS::AtMostOnce,
    }
}

fn parse_publish(base_topic: &str, topic: &str, payload: &[u8]) -> Option<DataEvent> {
    let rest = topic.strip_prefix(base_topic)?.strip_prefix('/')?;
    let (interface, path) = match rest.split_once('/') {
        Some((interface, path)) => (interface, format!("/{path}")),
        None => (rest, String::from("/")),
    };
    if interface.is_empty() {
        return None;
    }
    let value = match serde_json::from_slice::<Value>(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!("undecodable payload on {topic}: {err}");
            return None;
        }
    };
    // The broker wraps data the same way the device does.
    let value = match value {
        Value::Object(mut map) if map.contains_key("v") => map.remove("v").unwrap_or(Value::Null),
        other => other,
    };
    Some(DataEvent {
        interface: interface.to_string(),
        path,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::TESTER_INTERFACE;

    #[test]
    fn publish_topic_layout() {
        assert_eq!(
            publish_topic("test/device1", TESTER_INTERFACE, "/"),
            "test/device1/com.astarte.Tester/"
        );
        assert_eq!(
            publish_topic("test/device1", "org.example.Values", "/speed"),
            "test/device1/org.example.Values/speed"
        );
    }

    #[test]
    fn wire_envelope_wraps_value_and_timestamp() {
        let envelope = wire_envelope(json!({ "counter": 2 }), 1700000000);
        assert_eq!(envelope["v"]["counter"], 2);
        assert_eq!(envelope["t"], 1700000000);
    }

    #[test]
    fn unique_reliability_publishes_exactly_once() {
        assert_eq!(publish_qos(&Interface::tester()), QoS::ExactlyOnce);
    }

    #[test]
    fn parse_publish_splits_interface_and_path() {
        let event = parse_publish(
            "test/device1",
            "test/device1/org.example.Values/speed",
            br#"{"v": 42}"#,
        )
        .unwrap();
        assert_eq!(event.interface, "org.example.Values");
        assert_eq!(event.path, "/speed");
        assert_eq!(event.value, json!(42));
    }

    #[test]
    fn parse_publish_unwraps_aggregate_envelope() {
        let event = parse_publish(
            "test/device1",
            "test/device1/com.astarte.Tester/",
            br#"{"v": {"counter": 1, "random": 7}, "t": 123}"#,
        )
        .unwrap();
        assert!(event.value.is_object());
        assert_eq!(event.value["counter"], 1);
    }

    #[test]
    fn parse_publish_ignores_foreign_topics() {
        assert!(parse_publish("test/device1", "other/device2/x", b"1").is_none());
        assert!(parse_publish("test/device1", "test/device1", b"1").is_none());
    }

    #[test]
    fn parse_publish_ignores_undecodable_payloads() {
        assert!(parse_publish("test/device1", "test/device1/x/", b"\xff\xfe").is_none());
    }

    #[tokio::test]
    async fn duplicate_interface_registration_fails() {
        let config = Config::new(
            "device1".into(),
            "secret".into(),
            "mqtt://localhost".into(),
            "test".into(),
            -1,
        );
        let (mut device, _event_loop) = DeviceClient::new(&config).unwrap();
        device.add_interface(Interface::tester()).unwrap();
        assert!(device.add_interface(Interface::tester()).is_err());
    }
}
