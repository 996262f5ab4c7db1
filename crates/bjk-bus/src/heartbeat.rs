//! Liveness beacon: periodic `perception.heartbeat.v1` publication.

use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use bjk_schemas::{streams, Envelope};

use crate::bus::MessageBus;

/// Spawn a background task that publishes `{"status": "ok"}` heartbeats on
/// an interval. Publish failures are logged and the beat continues; a dead
/// broker will surface through the workers anyway.
pub fn spawn_heartbeat(
    bus: Arc<MessageBus>,
    source_service: &str,
    interval: Duration,
) -> JoinHandle<()> {
    let source = source_service.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let mut payload = Map::new();
            payload.insert("status".to_string(), json!("ok"));
            let envelope = Envelope::now(streams::PERCEPTION_HEARTBEAT_V1, payload, Some(&source));
            if let Err(e) = bus.publish(streams::PERCEPTION_HEARTBEAT_V1, &envelope).await {
                warn!(error = %e, source = %source, "heartbeat publish failed");
            }
        }
    })
}
