//! The message-bus substrate every pipeline service stands on.
//!
//! Layers, bottom up:
//! - [`Broker`]: publish/consume primitive over named, append-only streams
//!   with consumer-group cursors ([`MemoryBroker`] in-process; a durable
//!   Postgres backend lives in `bjk-db`).
//! - [`MessageBus`]: contract-validated publish, poll, ack, dead-letter.
//! - [`MessageBus::run_worker`]: the at-least-once dispatch loop with
//!   idempotent effect, bounded retry, and poison-message containment.
//!
//! Delivery is at-least-once by design; correctness comes from the
//! [`IdempotencyStore`] consulted on every delivery, not from the broker.

pub mod broker;
pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod idempotency;
pub mod memory;
pub mod worker;

pub use broker::{Broker, BusError, RawMessage};
pub use bus::{DeadLetterEntry, MessageBus, ReceivedMessage};
pub use config::BusConfig;
pub use heartbeat::spawn_heartbeat;
pub use idempotency::{IdempotencyStore, LocalIdempotencyStore};
pub use memory::MemoryBroker;
pub use worker::EventHandler;
