//! Strict v1 contract validation.
//!
//! Validation is exact-match on key sets at both the envelope and payload
//! level: one extra or missing field fails, with a message naming the
//! offending keys. That strictness is the schema-evolution mechanism — a
//! producer that needs a wider payload introduces a `.v2` stream instead of
//! quietly widening v1.
//!
//! Dispatch is a registry lookup by schema name, populated once at startup;
//! an unregistered name is itself a violation. The registry holds no mutable
//! state and is safe to share across any number of producers and consumers.

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::streams;

type Payload = Map<String, Value>;

/// A malformed or schema-mismatched envelope/payload. Never retried: blocks
/// `publish` on the producer side and dead-letters on the consumer side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractViolation {
    detail: String,
}

impl ContractViolation {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contract violation: {}", self.detail)
    }
}

impl std::error::Error for ContractViolation {}

// ---------------------------------------------------------------------------
// Field-level checks
// ---------------------------------------------------------------------------

fn require_exact_keys(
    obj: &Payload,
    required: &[&str],
    optional: &[&str],
) -> Result<(), ContractViolation> {
    let keys: BTreeSet<&str> = obj.keys().map(String::as_str).collect();
    let required_set: BTreeSet<&str> = required.iter().copied().collect();

    let missing: Vec<&str> = required_set.difference(&keys).copied().collect();
    if !missing.is_empty() {
        return Err(ContractViolation::new(format!("missing keys: {missing:?}")));
    }

    let mut extra: Vec<&str> = Vec::new();
    for k in &keys {
        if !required_set.contains(k) && !optional.contains(k) {
            extra.push(*k);
        }
    }
    if !extra.is_empty() {
        return Err(ContractViolation::new(format!(
            "extra keys not allowed in v1: {extra:?}"
        )));
    }
    Ok(())
}

fn require_str<'a>(obj: &'a Payload, key: &str) -> Result<&'a str, ContractViolation> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        _ => Err(ContractViolation::new(format!(
            "{key} must be non-empty string"
        ))),
    }
}

fn require_int(obj: &Payload, key: &str) -> Result<i64, ContractViolation> {
    obj.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ContractViolation::new(format!("{key} must be int")))
}

fn require_number(obj: &Payload, key: &str) -> Result<f64, ContractViolation> {
    match obj.get(key) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ContractViolation::new(format!("{key} must be number"))),
        _ => Err(ContractViolation::new(format!("{key} must be number"))),
    }
}

fn require_bool(obj: &Payload, key: &str) -> Result<bool, ContractViolation> {
    // Actual JSON booleans only — 0/1 and "true"/"false" are violations.
    match obj.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        _ => Err(ContractViolation::new(format!("{key} must be bool"))),
    }
}

fn require_object<'a>(obj: &'a Payload, key: &str) -> Result<&'a Payload, ContractViolation> {
    match obj.get(key) {
        Some(Value::Object(m)) => Ok(m),
        _ => Err(ContractViolation::new(format!("{key} must be object"))),
    }
}

/// RFC-3339 with an explicit offset. A naive timestamp is a violation, never
/// an assumed-UTC default.
fn parse_rfc3339(s: &str) -> Result<DateTime<FixedOffset>, ContractViolation> {
    DateTime::parse_from_rfc3339(s)
        .map_err(|_| ContractViolation::new(format!("invalid timestamp (offset required): {s}")))
}

fn require_ts(obj: &Payload, key: &str) -> Result<(), ContractViolation> {
    parse_rfc3339(require_str(obj, key)?).map(|_| ())
}

// ---------------------------------------------------------------------------
// Per-schema rules
// ---------------------------------------------------------------------------

/// A named, pure predicate over a payload map: exact required key set plus
/// field-level type/range checks.
pub struct SchemaRule {
    required: &'static [&'static str],
    check: fn(&Payload) -> Result<(), ContractViolation>,
}

impl SchemaRule {
    fn new(
        required: &'static [&'static str],
        check: fn(&Payload) -> Result<(), ContractViolation>,
    ) -> Self {
        Self { required, check }
    }

    /// Exact-key-set check first, then field checks.
    pub fn validate(&self, payload: &Payload) -> Result<(), ContractViolation> {
        require_exact_keys(payload, self.required, &[])?;
        (self.check)(payload)
    }

    pub fn required_keys(&self) -> &'static [&'static str] {
        self.required
    }
}

fn check_heartbeat(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "status")?;
    Ok(())
}

fn check_market_data(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    require_str(p, "timeframe")?;
    for k in ["open", "high", "low", "close"] {
        if require_number(p, k)? <= 0.0 {
            return Err(ContractViolation::new(format!("{k} must be > 0")));
        }
    }
    if require_number(p, "volume")? < 0.0 {
        return Err(ContractViolation::new("volume must be >= 0"));
    }
    require_str(p, "source")?;
    Ok(())
}

fn check_variables_computed(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    require_object(p, "variables")?;
    require_object(p, "quality")?;
    Ok(())
}

fn check_regime_detected(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    require_str(p, "regime")?;
    Ok(())
}

fn check_opportunity_scored(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    let score = require_number(p, "opportunity_score")?;
    if !(0.0..=100.0).contains(&score) {
        return Err(ContractViolation::new("opportunity_score must be 0..100"));
    }
    let conf = require_number(p, "confidence")?;
    if !(0.0..=100.0).contains(&conf) {
        return Err(ContractViolation::new("confidence must be 0..100"));
    }
    require_str(p, "regime")?;
    require_object(p, "components")?;
    Ok(())
}

fn check_candidate_action(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    let action = require_str(p, "action")?;
    if !matches!(action, "BUY" | "SELL" | "HOLD") {
        return Err(ContractViolation::new("action must be BUY/SELL/HOLD"));
    }
    require_str(p, "strategy")?;
    let frac = require_number(p, "target_position_frac")?;
    if !(-1.0..=1.0).contains(&frac) {
        return Err(ContractViolation::new("target_position_frac must be -1..1"));
    }
    require_str(p, "rationale")?;
    Ok(())
}

fn check_risk_order(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    require_bool(p, "can_trade")?;
    let pos = require_number(p, "final_position_frac")?;
    if !(-1.0..=1.0).contains(&pos) {
        return Err(ContractViolation::new("final_position_frac must be -1..1"));
    }
    if require_number(p, "risk_per_trade")? < 0.0 {
        return Err(ContractViolation::new("risk_per_trade must be >= 0"));
    }
    require_str(p, "reason")?;
    require_object(p, "order")?;
    Ok(())
}

fn check_execution_order(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "order_id")?;
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    require_str(p, "status")?;
    if require_number(p, "filled_qty")? < 0.0 {
        return Err(ContractViolation::new("filled_qty must be >= 0"));
    }
    if require_number(p, "avg_price")? < 0.0 {
        return Err(ContractViolation::new("avg_price must be >= 0"));
    }
    require_str(p, "broker")?;
    Ok(())
}

fn check_trade_record(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "trade_id")?;
    require_str(p, "symbol")?;
    require_ts(p, "ts")?;
    let status = require_str(p, "status")?;
    if !matches!(status, "EXECUTED" | "FAILED" | "PARTIAL") {
        return Err(ContractViolation::new(
            "status must be EXECUTED/FAILED/PARTIAL",
        ));
    }
    require_object(p, "order")?;
    require_object(p, "decision_snapshot")?;
    Ok(())
}

fn check_backtest_completed(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "backtest_id")?;
    require_str(p, "strategy")?;
    require_str(p, "start_date")?;
    require_str(p, "end_date")?;
    require_object(p, "metrics")?;
    require_object(p, "parameters")?;
    Ok(())
}

fn check_parameter_proposed(p: &Payload) -> Result<(), ContractViolation> {
    require_str(p, "proposal_id")?;
    require_str(p, "strategy")?;
    require_object(p, "current_parameters")?;
    require_object(p, "proposed_parameters")?;
    require_str(p, "rationale")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const ENVELOPE_REQUIRED_KEYS: &[&str] = &[
    "event_id",
    "trace_id",
    "produced_at",
    "schema",
    "schema_version",
    "payload",
];
const ENVELOPE_OPTIONAL_KEYS: &[&str] = &["source_service"];

/// Schema name → validation rule, populated once at startup. Immutable after
/// construction, so a shared reference is safe from any thread.
pub struct ContractRegistry {
    rules: HashMap<&'static str, SchemaRule>,
}

impl ContractRegistry {
    /// The full v1 catalog.
    pub fn v1() -> Self {
        let mut rules = HashMap::new();

        rules.insert(
            streams::PERCEPTION_HEARTBEAT_V1,
            SchemaRule::new(&["status"], check_heartbeat),
        );
        rules.insert(
            streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
            SchemaRule::new(
                &[
                    "symbol", "ts", "timeframe", "open", "high", "low", "close", "volume",
                    "source",
                ],
                check_market_data,
            ),
        );
        for schema in [
            streams::VARIABLES_MARKET_COMPUTED_V1,
            streams::VARIABLES_STOCK_COMPUTED_V1,
        ] {
            rules.insert(
                schema,
                SchemaRule::new(&["symbol", "ts", "variables", "quality"], check_variables_computed),
            );
        }
        rules.insert(
            streams::SIGNALS_REGIME_DETECTED_V1,
            SchemaRule::new(&["symbol", "ts", "regime"], check_regime_detected),
        );
        rules.insert(
            streams::SIGNALS_OPPORTUNITY_SCORED_V1,
            SchemaRule::new(
                &[
                    "symbol",
                    "ts",
                    "opportunity_score",
                    "confidence",
                    "regime",
                    "components",
                ],
                check_opportunity_scored,
            ),
        );
        rules.insert(
            streams::STRATEGY_CANDIDATE_ACTION_GENERATED_V1,
            SchemaRule::new(
                &[
                    "symbol",
                    "ts",
                    "action",
                    "strategy",
                    "target_position_frac",
                    "rationale",
                ],
                check_candidate_action,
            ),
        );
        for schema in [streams::RISK_ORDER_APPROVED_V1, streams::RISK_ORDER_REJECTED_V1] {
            rules.insert(
                schema,
                SchemaRule::new(
                    &[
                        "symbol",
                        "ts",
                        "can_trade",
                        "final_position_frac",
                        "risk_per_trade",
                        "reason",
                        "order",
                    ],
                    check_risk_order,
                ),
            );
        }
        for schema in [
            streams::EXECUTION_ORDER_EXECUTED_V1,
            streams::EXECUTION_ORDER_FAILED_V1,
        ] {
            rules.insert(
                schema,
                SchemaRule::new(
                    &[
                        "order_id", "symbol", "ts", "status", "filled_qty", "avg_price", "broker",
                    ],
                    check_execution_order,
                ),
            );
        }
        rules.insert(
            streams::POSTMORTEM_TRADE_RECORD_CREATED_V1,
            SchemaRule::new(
                &["trade_id", "symbol", "ts", "status", "order", "decision_snapshot"],
                check_trade_record,
            ),
        );
        rules.insert(
            streams::EVOLUTION_BACKTEST_COMPLETED_V1,
            SchemaRule::new(
                &[
                    "backtest_id",
                    "strategy",
                    "start_date",
                    "end_date",
                    "metrics",
                    "parameters",
                ],
                check_backtest_completed,
            ),
        );
        rules.insert(
            streams::EVOLUTION_PARAMETER_PROPOSED_V1,
            SchemaRule::new(
                &[
                    "proposal_id",
                    "strategy",
                    "current_parameters",
                    "proposed_parameters",
                    "rationale",
                ],
                check_parameter_proposed,
            ),
        );

        Self { rules }
    }

    /// Look up the rule for a schema name. `None` means unregistered.
    pub fn rule(&self, schema: &str) -> Option<&SchemaRule> {
        self.rules.get(schema)
    }

    /// Registered schema names, sorted.
    pub fn schemas(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.rules.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Strict v1 validation of a wire map, in fixed order: envelope key set,
    /// envelope field types, version/name consistency, payload shape, then
    /// the schema-specific rule.
    pub fn validate_wire(&self, event: &Value) -> Result<(), ContractViolation> {
        let obj = event
            .as_object()
            .ok_or_else(|| ContractViolation::new("envelope must be object"))?;

        require_exact_keys(obj, ENVELOPE_REQUIRED_KEYS, ENVELOPE_OPTIONAL_KEYS)?;
        require_str(obj, "event_id")?;
        require_str(obj, "trace_id")?;
        require_ts(obj, "produced_at")?;

        let schema = require_str(obj, "schema")?;
        let schema_version = require_int(obj, "schema_version")?;
        // Mismatches are rejected even when both halves look fine in
        // isolation — `schema_version: 2` with a `.v1` name is a violation.
        if schema_version != 1 || !schema.ends_with(".v1") {
            return Err(ContractViolation::new(
                "schema_version must be 1 and schema must end with .v1",
            ));
        }

        if obj.contains_key("source_service") {
            require_str(obj, "source_service")?;
        }

        let payload = require_object(obj, "payload")?;
        self.validate_payload(schema, payload)
    }

    /// Dispatch to the schema-specific rule by exact name match.
    pub fn validate_payload(
        &self,
        schema: &str,
        payload: &Payload,
    ) -> Result<(), ContractViolation> {
        let rule = self
            .rules
            .get(schema)
            .ok_or_else(|| ContractViolation::new(format!("unknown schema: {schema}")))?;
        rule.validate(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn market_data_wire() -> Value {
        json!({
            "event_id": "evt-1",
            "trace_id": "trc-1",
            "produced_at": "2026-01-01T00:00:00+00:00",
            "schema": streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
            "schema_version": 1,
            "payload": {
                "symbol": "AAPL",
                "ts": "2026-01-01T00:00:00+00:00",
                "timeframe": "1m",
                "open": 100,
                "high": 101,
                "low": 99,
                "close": 100.5,
                "volume": 10,
                "source": "demo"
            }
        })
    }

    fn registry() -> ContractRegistry {
        ContractRegistry::v1()
    }

    #[test]
    fn golden_market_data_validates() {
        registry().validate_wire(&market_data_wire()).unwrap();
    }

    #[test]
    fn zero_open_price_cites_the_field() {
        let mut ev = market_data_wire();
        ev["payload"]["open"] = json!(0);
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("open must be > 0"), "{err}");
    }

    #[test]
    fn one_extra_payload_key_fails() {
        let mut ev = market_data_wire();
        ev["payload"]["vwap"] = json!(100.2);
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("extra keys"), "{err}");
        assert!(err.detail().contains("vwap"), "{err}");
    }

    #[test]
    fn one_missing_payload_key_fails() {
        let mut ev = market_data_wire();
        ev["payload"].as_object_mut().unwrap().remove("volume");
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("missing keys"), "{err}");
        assert!(err.detail().contains("volume"), "{err}");
    }

    #[test]
    fn extra_envelope_key_fails() {
        let mut ev = market_data_wire();
        ev["priority"] = json!("high");
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("extra keys"), "{err}");
    }

    #[test]
    fn offsetless_produced_at_fails() {
        let mut ev = market_data_wire();
        ev["produced_at"] = json!("2026-01-01T00:00:00");
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("timestamp"), "{err}");
    }

    #[test]
    fn zulu_offset_is_accepted() {
        let mut ev = market_data_wire();
        ev["produced_at"] = json!("2026-01-01T00:00:00Z");
        registry().validate_wire(&ev).unwrap();
    }

    #[test]
    fn version_name_mismatch_fails_both_ways() {
        let mut ev = market_data_wire();
        ev["schema_version"] = json!(2);
        assert!(registry().validate_wire(&ev).is_err());

        let mut ev = market_data_wire();
        ev["schema"] = json!("perception.market_data.collected.v2");
        assert!(registry().validate_wire(&ev).is_err());
    }

    #[test]
    fn unknown_schema_fails() {
        let ev = json!({
            "event_id": "evt-1",
            "trace_id": "trc-1",
            "produced_at": "2026-01-01T00:00:00+00:00",
            "schema": "perception.sentiment.scored.v1",
            "schema_version": 1,
            "payload": {}
        });
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("unknown schema"), "{err}");
    }

    #[test]
    fn empty_event_id_fails() {
        let mut ev = market_data_wire();
        ev["event_id"] = json!("   ");
        assert!(registry().validate_wire(&ev).is_err());
    }

    #[test]
    fn payload_must_be_object() {
        let mut ev = market_data_wire();
        ev["payload"] = json!([1, 2, 3]);
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("payload must be object"), "{err}");
    }

    #[test]
    fn action_enum_is_closed() {
        let ev = json!({
            "event_id": "evt-2",
            "trace_id": "trc-2",
            "produced_at": "2026-01-01T00:00:00+00:00",
            "schema": streams::STRATEGY_CANDIDATE_ACTION_GENERATED_V1,
            "schema_version": 1,
            "payload": {
                "symbol": "AAPL",
                "ts": "2026-01-01T00:00:00+00:00",
                "action": "SHORT",
                "strategy": "trend_following",
                "target_position_frac": 0.25,
                "rationale": "breakout"
            }
        });
        let err = registry().validate_wire(&ev).unwrap_err();
        assert!(err.detail().contains("BUY/SELL/HOLD"), "{err}");
    }

    #[test]
    fn position_fraction_interval_is_closed() {
        let base = |frac: f64| {
            json!({
                "event_id": "evt-3",
                "trace_id": "trc-3",
                "produced_at": "2026-01-01T00:00:00+00:00",
                "schema": streams::STRATEGY_CANDIDATE_ACTION_GENERATED_V1,
                "schema_version": 1,
                "payload": {
                    "symbol": "AAPL",
                    "ts": "2026-01-01T00:00:00+00:00",
                    "action": "SELL",
                    "strategy": "mean_reversion",
                    "target_position_frac": frac,
                    "rationale": "reversion"
                }
            })
        };
        registry().validate_wire(&base(-1.0)).unwrap();
        registry().validate_wire(&base(1.0)).unwrap();
        assert!(registry().validate_wire(&base(1.01)).is_err());
    }

    #[test]
    fn can_trade_must_be_actual_bool() {
        let base = |can_trade: Value| {
            json!({
                "event_id": "evt-4",
                "trace_id": "trc-4",
                "produced_at": "2026-01-01T00:00:00+00:00",
                "schema": streams::RISK_ORDER_APPROVED_V1,
                "schema_version": 1,
                "payload": {
                    "symbol": "AAPL",
                    "ts": "2026-01-01T00:00:00+00:00",
                    "can_trade": can_trade,
                    "final_position_frac": 0.1,
                    "risk_per_trade": 0.02,
                    "reason": "within limits",
                    "order": {"qty": 10}
                }
            })
        };
        registry().validate_wire(&base(json!(true))).unwrap();
        assert!(registry().validate_wire(&base(json!(1))).is_err());
        assert!(registry().validate_wire(&base(json!("true"))).is_err());
    }

    #[test]
    fn opportunity_score_range_is_0_to_100() {
        let base = |score: f64| {
            json!({
                "event_id": "evt-5",
                "trace_id": "trc-5",
                "produced_at": "2026-01-01T00:00:00+00:00",
                "schema": streams::SIGNALS_OPPORTUNITY_SCORED_V1,
                "schema_version": 1,
                "payload": {
                    "symbol": "AAPL",
                    "ts": "2026-01-01T00:00:00+00:00",
                    "opportunity_score": score,
                    "confidence": 50,
                    "regime": "trending",
                    "components": {}
                }
            })
        };
        registry().validate_wire(&base(0.0)).unwrap();
        registry().validate_wire(&base(100.0)).unwrap();
        assert!(registry().validate_wire(&base(100.5)).is_err());
    }

    #[test]
    fn every_registered_schema_has_a_v1_suffix_and_rule() {
        let reg = registry();
        let names = reg.schemas();
        assert_eq!(names.len(), streams::ALL_V1.len());
        for name in streams::ALL_V1 {
            assert!(reg.rule(name).is_some(), "no rule for {name}");
        }
    }
}
