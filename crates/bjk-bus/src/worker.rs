//! The reliable dispatch loop: at-least-once delivery turned into
//! exactly-once effect.
//!
//! Per message the loop moves Received → Validating → Deduplicating →
//! Handling → Acked | DeadLettered. Two invariants hold throughout:
//!
//! 1. Every message that leaves the pending list is either acked or
//!    dead-lettered — never silently dropped.
//! 2. The handler runs at most once per event_id while that id is inside
//!    its idempotency TTL, no matter how many times the broker delivers it.
//!
//! Retries re-publish the raw body at the tail of the same stream, so a
//! retried event loses its original relative ordering. That is the accepted
//! tradeoff of this strategy; in-place redelivery would change the broker
//! contract that dedup and dead-letter accounting depend on.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use bjk_schemas::Envelope;

use crate::broker::BusError;
use crate::bus::{MessageBus, ReceivedMessage};
use crate::idempotency::IdempotencyStore;

/// Domain logic invoked once per fresh, contract-valid envelope.
///
/// An `Err` is a [`HandlerFailure`]: retried up to the attempt bound, then
/// dead-lettered. Handlers must tolerate being skipped (a duplicate delivery
/// is acked without invocation).
///
/// [`HandlerFailure`]: crate::broker::BusError
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

impl MessageBus {
    /// Long-running dispatch loop for one (stream, group, consumer) triple;
    /// run one instance per stream on its own task.
    ///
    /// `stop_after` bounds the number of dispatched messages for tests and
    /// tooling; production workers pass `None` and loop until the process is
    /// terminated. Contract and handler failures are contained locally (the
    /// message is retried or dead-lettered); broker failures propagate and
    /// end the loop — restarting is safe because dispatch is idempotent.
    pub async fn run_worker(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        handler: &dyn EventHandler,
        idempotency: &dyn IdempotencyStore,
        stop_after: Option<usize>,
    ) -> Result<(), BusError> {
        info!(stream, group, consumer, "worker started");
        let mut dispatched = 0usize;
        loop {
            // An empty poll is not an error; just go around again.
            let batch = self.poll(stream, group, consumer).await?;
            for message in &batch {
                self.dispatch(stream, group, message, handler, idempotency)
                    .await?;
                dispatched += 1;
                if let Some(limit) = stop_after {
                    if dispatched >= limit {
                        info!(stream, group, dispatched, "worker stop_after reached");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One message through the state machine.
    async fn dispatch(
        &self,
        stream: &str,
        group: &str,
        message: &ReceivedMessage,
        handler: &dyn EventHandler,
        idempotency: &dyn IdempotencyStore,
    ) -> Result<(), BusError> {
        // Received → Validating. Re-validate from the raw body: the entry
        // may have been written by an older or buggy producer, and a message
        // that can never be valid must not be retried.
        let envelope = match self.revalidate(message) {
            Ok(envelope) => envelope,
            Err(detail) => {
                self.dead_letter(stream, message, &format!("contract_invalid: {detail}"))
                    .await?;
                self.ack(stream, group, &message.id).await?;
                return Ok(());
            }
        };

        // Validating → Deduplicating. This check is mandatory, not an
        // optimization: group semantics hand an entry to one consumer at a
        // time, but redelivery and retry both produce repeat event_ids.
        if idempotency
            .seen(&envelope.event_id)
            .await
            .map_err(backend_error)?
        {
            debug!(stream, event_id = %envelope.event_id, "duplicate, acked without handling");
            self.ack(stream, group, &message.id).await?;
            return Ok(());
        }

        // Deduplicating → Handling.
        match handler.handle(&envelope).await {
            Ok(()) => {
                idempotency
                    .mark(&envelope.event_id, self.config().idempotency_ttl)
                    .await
                    .map_err(backend_error)?;
                self.ack(stream, group, &message.id).await?;
                debug!(stream, event_id = %envelope.event_id, "handled");
            }
            Err(handler_err) => {
                let attempts = idempotency
                    .incr_attempt(&envelope.event_id, self.config().attempt_ttl)
                    .await
                    .map_err(backend_error)?;
                let max = self.config().max_attempts;

                if attempts >= u64::from(max) {
                    self.dead_letter(
                        stream,
                        message,
                        &format!("handler_failed_after_{max}: {handler_err:#}"),
                    )
                    .await?;
                    self.ack(stream, group, &message.id).await?;
                } else {
                    // Ack to release the pending slot, then retry at the
                    // tail after the backoff. The event is NOT marked seen,
                    // so its next delivery re-enters the loop fresh under a
                    // new message id.
                    self.ack(stream, group, &message.id).await?;
                    tokio::time::sleep(self.config().retry_backoff).await;
                    self.republish_raw(stream, &message.body).await?;
                    warn!(
                        stream,
                        event_id = %envelope.event_id,
                        attempts,
                        error = %format!("{handler_err:#}"),
                        "handler failed, requeued"
                    );
                }
            }
        }
        Ok(())
    }

    fn revalidate(&self, message: &ReceivedMessage) -> Result<Envelope, String> {
        let wire: serde_json::Value = serde_json::from_str(&message.body)
            .map_err(|e| format!("undecodable body: {e}"))?;
        self.registry()
            .validate_wire(&wire)
            .map_err(|v| v.detail().to_string())?;
        Envelope::from_wire(&wire).map_err(|v| v.detail().to_string())
    }
}

fn backend_error(e: anyhow::Error) -> BusError {
    BusError::Broker(format!("idempotency backend: {e:#}"))
}
