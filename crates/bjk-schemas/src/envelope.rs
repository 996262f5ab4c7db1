//! The canonical unit of communication: an immutable, versioned envelope
//! wrapping a schema-specific payload.
//!
//! `produced_at` is a `DateTime<FixedOffset>` on purpose: the offset travels
//! with the value, and deserializing a timestamp without one fails instead of
//! silently assuming UTC.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::validate::ContractViolation;

/// Wire shape, v1. Exact top-level keys: `event_id`, `trace_id`,
/// `produced_at`, `schema`, `schema_version`, `payload`, plus optional
/// `source_service`. No other keys are tolerated in v1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Globally unique, producer-assigned.
    pub event_id: String,
    /// Correlates a causal chain of envelopes across services.
    pub trace_id: String,
    /// Always serialized with an explicit UTC offset.
    pub produced_at: DateTime<FixedOffset>,
    /// Payload shape identifier; must end in a version suffix (`.v1`).
    pub schema: String,
    /// Must equal the version implied by `schema`.
    pub schema_version: i64,
    /// Open map of schema-specific fields.
    pub payload: Map<String, Value>,
    /// Producer identity, if the producer chose to state one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,
}

impl Envelope {
    /// Build a v1 envelope stamped with fresh ids and the current instant.
    pub fn now(
        schema: impl Into<String>,
        payload: Map<String, Value>,
        source_service: Option<&str>,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            trace_id: new_trace_id(),
            produced_at: Utc::now().fixed_offset(),
            schema: schema.into(),
            schema_version: 1,
            payload,
            source_service: source_service.map(str::to_string),
        }
    }

    /// Pure conversion to the wire representation (a plain JSON object).
    pub fn to_wire(&self) -> Value {
        // Serialization of this struct cannot fail: keys are strings and
        // `produced_at` always formats as RFC-3339 with offset.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Pure conversion from a wire map.
    ///
    /// This is structural only (shape + parseable timestamp). Contract
    /// validation against the schema catalog is a separate, earlier step —
    /// see [`crate::ContractRegistry::validate_wire`].
    pub fn from_wire(wire: &Value) -> Result<Self, ContractViolation> {
        serde_json::from_value(wire.clone())
            .map_err(|e| ContractViolation::new(format!("malformed envelope: {e}")))
    }
}

/// Fresh producer-assigned event id.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fresh causal-chain trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heartbeat() -> Envelope {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("ok"));
        Envelope::now("perception.heartbeat.v1", payload, Some("perception-service"))
    }

    #[test]
    fn wire_round_trip_preserves_envelope() {
        let ev = heartbeat();
        let wire = ev.to_wire();
        let back = Envelope::from_wire(&wire).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn produced_at_serializes_with_explicit_offset() {
        let wire = heartbeat().to_wire();
        let ts = wire["produced_at"].as_str().unwrap();
        assert!(
            ts.ends_with('Z') || ts.contains('+') || ts.rfind('-') > Some(9),
            "no offset in {ts}"
        );
    }

    #[test]
    fn offsetless_timestamp_is_rejected_not_assumed_utc() {
        let mut wire = heartbeat().to_wire();
        wire["produced_at"] = json!("2026-01-01T00:00:00");
        assert!(Envelope::from_wire(&wire).is_err());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let mut wire = heartbeat().to_wire();
        wire["routing_hint"] = json!("fast-lane");
        assert!(Envelope::from_wire(&wire).is_err());
    }

    #[test]
    fn source_service_is_omitted_when_absent() {
        let mut ev = heartbeat();
        ev.source_service = None;
        let wire = ev.to_wire();
        assert!(wire.get("source_service").is_none());
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(new_event_id(), new_event_id());
        assert_ne!(new_trace_id(), new_trace_id());
    }
}
