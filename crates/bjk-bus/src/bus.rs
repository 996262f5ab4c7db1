//! Contract-validated publish/consume over a [`Broker`].
//!
//! Invalid events are never written to a live stream: `publish` validates
//! the wire form first and fails synchronously. The only path that writes
//! without validation is the dead-letter append, which carries entries that
//! were already quarantined by the dispatch loop.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use bjk_schemas::{streams, ContractRegistry, Envelope};

use crate::broker::{Broker, BusError, RawMessage};
use crate::config::BusConfig;

/// One claimed stream entry, decoded as far as possible. A body that cannot
/// be parsed as a valid envelope still comes back (`envelope: None`) so the
/// dispatch loop can quarantine it instead of hanging the partition.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Broker-assigned id (distinct from the envelope's `event_id`).
    pub id: String,
    /// Raw body exactly as stored.
    pub body: String,
    /// Present only when the body parses as a structurally sound envelope.
    pub envelope: Option<Envelope>,
}

/// Terminal record appended to `dlq.<stream>.v1`. Never reprocessed
/// automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Original body: the wire object when it parses, else the raw string.
    pub event: Value,
    pub error: String,
    pub failed_at: DateTime<FixedOffset>,
    pub original_stream: String,
    pub original_message_id: String,
}

/// Publish/consume facade binding a broker to the v1 contract catalog.
///
/// Construct once at service startup with an explicit broker handle; clone
/// the `Arc` into each worker task. No hidden global state.
pub struct MessageBus {
    broker: Arc<dyn Broker>,
    registry: ContractRegistry,
    config: BusConfig,
}

impl MessageBus {
    pub fn new(broker: Arc<dyn Broker>, config: BusConfig) -> Self {
        Self {
            broker,
            registry: ContractRegistry::v1(),
            config,
        }
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Validate, serialize, append. A [`ContractViolation`] blocks the write
    /// — there is no partial publish.
    ///
    /// [`ContractViolation`]: bjk_schemas::ContractViolation
    pub async fn publish(&self, stream: &str, envelope: &Envelope) -> Result<String, BusError> {
        let wire = envelope.to_wire();
        self.registry.validate_wire(&wire)?;

        let body = wire.to_string();
        let message_id = self.broker.append(stream, &body).await?;
        debug!(
            stream,
            event_id = %envelope.event_id,
            message_id = %message_id,
            "published"
        );
        Ok(message_id)
    }

    /// Claim a batch for `(stream, group, consumer)`: stale pending entries
    /// from dead consumers first, then new entries, blocking up to the
    /// configured bound. Empty on timeout.
    pub async fn poll(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let mut batch = self
            .broker
            .claim_stale(
                stream,
                group,
                consumer,
                self.config.claim_min_idle,
                self.config.batch_size,
            )
            .await?;
        if batch.is_empty() {
            batch = self
                .broker
                .read_group(
                    stream,
                    group,
                    consumer,
                    self.config.batch_size,
                    self.config.block,
                )
                .await?;
        }
        Ok(batch.into_iter().map(decode).collect())
    }

    /// Bind a consumer group to a stream (cursor created at the tail if
    /// absent). Call at service startup, before producers begin writing.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        self.broker.ensure_group(stream, group).await
    }

    /// Idempotent per-group acknowledgment.
    pub async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<(), BusError> {
        self.broker.ack(stream, group, message_id).await
    }

    /// Quarantine a message onto the stream's dead-letter counterpart.
    pub async fn dead_letter(
        &self,
        stream: &str,
        message: &ReceivedMessage,
        error: &str,
    ) -> Result<String, BusError> {
        let event = serde_json::from_str::<Value>(&message.body)
            .unwrap_or_else(|_| Value::String(message.body.clone()));
        let entry = DeadLetterEntry {
            event,
            error: error.to_string(),
            failed_at: Utc::now().fixed_offset(),
            original_stream: stream.to_string(),
            original_message_id: message.id.clone(),
        };
        let body = serde_json::to_string(&entry)
            .map_err(|e| BusError::Broker(format!("serialize dead-letter entry: {e}")))?;

        let dlq = streams::dlq_stream(stream);
        let id = self.broker.append(&dlq, &body).await?;
        warn!(
            stream,
            dlq = %dlq,
            original_message_id = %message.id,
            error,
            "dead-lettered"
        );
        Ok(id)
    }

    /// Raw re-append of an already-stored body (retry path). Skips
    /// validation: the body validated when it first entered the stream.
    pub(crate) async fn republish_raw(&self, stream: &str, body: &str) -> Result<String, BusError> {
        self.broker.append(stream, body).await
    }

    /// Dead-letter entries currently on a stream's DLQ (inspection/tooling).
    pub async fn dead_letters(
        &self,
        stream: &str,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, BusError> {
        let raw = self.broker.range(&streams::dlq_stream(stream), count).await?;
        Ok(raw
            .iter()
            .filter_map(|m| serde_json::from_str(&m.body).ok())
            .collect())
    }
}

fn decode(raw: RawMessage) -> ReceivedMessage {
    let envelope = serde_json::from_str::<Value>(&raw.body)
        .ok()
        .and_then(|wire| Envelope::from_wire(&wire).ok());
    ReceivedMessage {
        id: raw.id,
        body: raw.body,
        envelope,
    }
}
