//! Event contracts for the blackjack pipeline.
//!
//! Three things live here and nothing else: the envelope wire shape
//! ([`Envelope`]), the frozen v1 stream-name registry ([`streams`]), and the
//! strict per-schema validation rules ([`ContractRegistry`]). Everything is
//! pure and side-effect free so producers and consumers can share it.

pub mod envelope;
pub mod streams;
pub mod validate;

pub use envelope::{new_event_id, new_trace_id, Envelope};
pub use validate::{ContractRegistry, ContractViolation, SchemaRule};
