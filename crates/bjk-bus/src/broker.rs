//! Broker boundary: a partitioned, append-only log with consumer-group
//! cursors, acknowledgment, and redelivery of unacknowledged entries.
//!
//! The dispatch loop observes group state only through these operations;
//! cursors and pending lists are owned by the backend.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use bjk_schemas::ContractViolation;

/// Errors crossing the bus boundary.
#[derive(Debug)]
pub enum BusError {
    /// Malformed or schema-mismatched envelope. Blocks publish on the
    /// producer side; dead-letters on the consumer side. Never retried.
    Contract(ContractViolation),
    /// Broker or idempotency-backend failure. Allowed to propagate and
    /// terminate the worker loop; restart-on-crash is safe because dispatch
    /// is idempotent.
    Broker(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Contract(v) => write!(f, "{v}"),
            BusError::Broker(msg) => write!(f, "broker error: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<ContractViolation> for BusError {
    fn from(v: ContractViolation) -> Self {
        BusError::Contract(v)
    }
}

/// One stream entry as stored by the broker. `id` is broker-assigned and
/// distinct from the envelope's `event_id`: a retried event reappears under
/// a new `id` with the same `event_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub body: String,
}

/// Append-only stream backend with consumer-group semantics.
///
/// Within a stream, entries are delivered to a given consumer in append
/// order. A group's cursor is created at the tail on first contact, so a
/// late-joining group does not replay history.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a raw body to the named stream; returns the broker-assigned
    /// message id.
    async fn append(&self, stream: &str, body: &str) -> Result<String, BusError>;

    /// Create the group's cursor at the current tail if it does not exist.
    /// `read_group` does this implicitly on first contact; explicit creation
    /// exists so a deployment can bind its groups before producers start.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    /// Claim up to `count` entries not yet delivered to this group, blocking
    /// up to `block` when none are available. An empty batch on timeout is
    /// not an error. Claimed entries sit on the group's pending list until
    /// acked or re-claimed.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawMessage>, BusError>;

    /// Take over pending entries idle for at least `min_idle` (their
    /// original consumer is presumed dead). Redelivery path for crashed
    /// workers.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawMessage>, BusError>;

    /// Mark an entry durably processed for this group. Idempotent: acking
    /// twice (or acking an unknown id) is harmless.
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<(), BusError>;

    /// Read up to `count` entries from the start of a stream, ignoring
    /// groups. Inspection and dead-letter tooling only.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<RawMessage>, BusError>;

    /// Number of entries currently pending (delivered, unacked) for a group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, BusError>;
}
