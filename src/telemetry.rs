//! Bounded telemetry send loop, driven by the connected lifecycle event.

use std::ops::ControlFlow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;
use serde::Serialize;

use crate::device::{DataEvent, DeviceClient, DeviceConnection, DeviceEvents};

/// One synthetic telemetry sample. Built fresh each iteration and handed to
/// the device client as an object aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub timestamp: i64,
    pub counter: u64,
    pub random: i64,
}

/// Periodic publish driver.
///
/// Owns the per-session counter and the optional remaining-count. Registered
/// as the connected handler: the whole loop runs inline in `on_connected`,
/// deliberately occupying the dispatch task until the count is exhausted.
pub struct TelemetryLoop {
    interface: String,
    remaining: Option<u64>,
    interval: Duration,
    counter: u64,
}

impl TelemetryLoop {
    pub fn new(interface: impl Into<String>, limit: Option<u64>, interval: Duration) -> Self {
        TelemetryLoop {
            interface: interface.into(),
            remaining: limit,
            interval,
            counter: 0,
        }
    }

    /// Run publish iterations until the remaining-count hits zero; unbounded
    /// when no limit was set. A skipped publish while disconnected still
    /// consumes one iteration. Publish errors abort the loop and propagate.
    pub async fn run<C: DeviceConnection + Sync>(&mut self, device: &C) -> Result<ControlFlow<()>> {
        // The counter is scoped to one connected session.
        self.counter = 0;

        while self.remaining.map_or(true, |n| n > 0) {
            self.counter += 1;
            let timestamp = unix_timestamp();
            let payload = TelemetryPayload {
                timestamp,
                counter: self.counter,
                random: random_value(),
            };

            if !device.is_connected() {
                warn!("connection absent, cannot publish sample {}", self.counter);
            } else {
                device
                    .send_aggregate(&self.interface, "/", serde_json::to_value(&payload)?, timestamp)
                    .await?;
            }
            info!("sent {}", self.counter);

            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            tokio::time::sleep(self.interval).await;
        }

        info!("send limit reached, stopping");
        Ok(ControlFlow::Break(()))
    }
}

#[async_trait]
impl DeviceEvents for TelemetryLoop {
    async fn on_connected(&mut self, device: &DeviceClient) -> Result<ControlFlow<()>> {
        info!("device connected");
        self.run(device).await
    }

    async fn on_disconnected(&mut self) {
        info!("device disconnected");
    }

    async fn on_data_received(&mut self, event: DataEvent) {
        info!("received data on {}{}: {}", event.interface, event.path, event.value);
    }

    async fn on_aggregate_data_received(&mut self, event: DataEvent) {
        info!("received aggregate on {}{}: {}", event.interface, event.path, event.value);
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Uniform sample in [0, 1000], both ends included.
fn random_value() -> i64 {
    rand::thread_rng().gen_range(0..=1000)
}
