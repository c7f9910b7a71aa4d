//! Liveness pings, independent of playlist state.

use crate::api::ServerClient;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Ping the server every `period`. Failures are logged and otherwise ignored;
/// the next tick is the only retry.
pub fn spawn_heartbeat(api: ServerClient, device_id: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            beat(&api, &device_id).await;
        }
    })
}

/// Send one heartbeat. Returns whether the server accepted it.
pub async fn beat(api: &ServerClient, device_id: &str) -> bool {
    match api.heartbeat(device_id).await {
        Ok(()) => {
            tracing::debug!("Heartbeat sent");
            true
        }
        Err(e) => {
            tracing::warn!("Heartbeat failed: {}", e);
            false
        }
    }
}
