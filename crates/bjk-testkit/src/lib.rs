//! Test fixtures shared by the scenario suite: one golden envelope per
//! catalogued schema, scripted handlers, and a memory-bus harness.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bjk_bus::{BusConfig, EventHandler, MemoryBroker, MessageBus};
use bjk_schemas::{streams, Envelope};

/// Fresh in-process bus plus a handle on its broker for direct inspection.
pub fn memory_bus(config: BusConfig) -> (Arc<MemoryBroker>, Arc<MessageBus>) {
    let broker = Arc::new(MemoryBroker::new());
    let bus = Arc::new(MessageBus::new(broker.clone(), config));
    (broker, bus)
}

/// Bus tuned for fast scenario tests: short poll block, tiny backoff,
/// three attempts.
pub fn fast_test_config() -> BusConfig {
    BusConfig {
        block: std::time::Duration::from_millis(200),
        max_attempts: 3,
        retry_backoff: std::time::Duration::from_millis(10),
        idempotency_ttl: std::time::Duration::from_secs(60),
        attempt_ttl: std::time::Duration::from_secs(60),
        ..BusConfig::default()
    }
}

const TS: &str = "2026-01-01T00:00:00+00:00";

/// Contract-valid payload for a catalogued schema.
///
/// Panics on an uncatalogued name — fixtures for unknown schemas would be a
/// bug in the test, not a scenario worth modeling.
pub fn golden_payload(schema: &str) -> Map<String, Value> {
    let value = match schema {
        streams::PERCEPTION_HEARTBEAT_V1 => json!({"status": "ok"}),
        streams::PERCEPTION_MARKET_DATA_COLLECTED_V1 => json!({
            "symbol": "AAPL",
            "ts": TS,
            "timeframe": "1m",
            "open": 100,
            "high": 101,
            "low": 99,
            "close": 100.5,
            "volume": 10,
            "source": "demo"
        }),
        streams::VARIABLES_MARKET_COMPUTED_V1 | streams::VARIABLES_STOCK_COMPUTED_V1 => json!({
            "symbol": "AAPL",
            "ts": TS,
            "variables": {"momentum_20d": 0.042},
            "quality": {"coverage": 1.0}
        }),
        streams::SIGNALS_REGIME_DETECTED_V1 => json!({
            "symbol": "AAPL",
            "ts": TS,
            "regime": "trending"
        }),
        streams::SIGNALS_OPPORTUNITY_SCORED_V1 => json!({
            "symbol": "AAPL",
            "ts": TS,
            "opportunity_score": 72.5,
            "confidence": 64,
            "regime": "trending",
            "components": {"volume_price": 0.8}
        }),
        streams::STRATEGY_CANDIDATE_ACTION_GENERATED_V1 => json!({
            "symbol": "AAPL",
            "ts": TS,
            "action": "BUY",
            "strategy": "trend_following",
            "target_position_frac": 0.25,
            "rationale": "breakout above 20d high"
        }),
        streams::RISK_ORDER_APPROVED_V1 | streams::RISK_ORDER_REJECTED_V1 => json!({
            "symbol": "AAPL",
            "ts": TS,
            "can_trade": true,
            "final_position_frac": 0.2,
            "risk_per_trade": 0.01,
            "reason": "within limits",
            "order": {"qty": 100, "side": "BUY"}
        }),
        streams::EXECUTION_ORDER_EXECUTED_V1 | streams::EXECUTION_ORDER_FAILED_V1 => json!({
            "order_id": "ord-1",
            "symbol": "AAPL",
            "ts": TS,
            "status": "FILLED",
            "filled_qty": 100,
            "avg_price": 100.42,
            "broker": "paper"
        }),
        streams::POSTMORTEM_TRADE_RECORD_CREATED_V1 => json!({
            "trade_id": "trd-1",
            "symbol": "AAPL",
            "ts": TS,
            "status": "EXECUTED",
            "order": {"qty": 100},
            "decision_snapshot": {"regime": "trending"}
        }),
        streams::EVOLUTION_BACKTEST_COMPLETED_V1 => json!({
            "backtest_id": "bt-1",
            "strategy": "trend_following",
            "start_date": "2025-01-01",
            "end_date": "2025-12-31",
            "metrics": {"sharpe": 1.3},
            "parameters": {"lookback": 20}
        }),
        streams::EVOLUTION_PARAMETER_PROPOSED_V1 => json!({
            "proposal_id": "prop-1",
            "strategy": "trend_following",
            "current_parameters": {"lookback": 20},
            "proposed_parameters": {"lookback": 30},
            "rationale": "improved sharpe in walk-forward"
        }),
        other => panic!("no golden payload for schema {other}"),
    };
    match value {
        Value::Object(map) => map,
        _ => unreachable!("golden payloads are objects"),
    }
}

/// Golden envelope for a catalogued schema, freshly stamped.
pub fn golden(schema: &str) -> Envelope {
    Envelope::now(schema, golden_payload(schema), Some("testkit"))
}

/// One golden envelope per v1 stream.
pub fn all_golden() -> Vec<Envelope> {
    streams::ALL_V1.iter().map(|s| golden(s)).collect()
}

// ---------------------------------------------------------------------------
// Scripted handlers
// ---------------------------------------------------------------------------

/// Records every envelope it successfully handles, in order.
#[derive(Default)]
pub struct RecordingHandler {
    handled: Mutex<Vec<Envelope>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.handled.lock().expect("recording handler poisoned").len()
    }

    pub fn handled(&self) -> Vec<Envelope> {
        self.handled.lock().expect("recording handler poisoned").clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.handled
            .lock()
            .expect("recording handler poisoned")
            .push(envelope.clone());
        Ok(())
    }
}

/// Fails every invocation.
pub struct AlwaysFailHandler {
    invocations: AtomicUsize,
}

impl AlwaysFailHandler {
    pub fn new() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Default for AlwaysFailHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for AlwaysFailHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("scripted failure for {}", envelope.event_id)
    }
}

/// Fails the first `n` invocations, then behaves like a recorder.
pub struct FailFirstNHandler {
    remaining_failures: AtomicUsize,
    successes: RecordingHandler,
}

impl FailFirstNHandler {
    pub fn new(n: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(n),
            successes: RecordingHandler::new(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.successes.count()
    }

    pub fn successes(&self) -> Vec<Envelope> {
        self.successes.handled()
    }
}

#[async_trait]
impl EventHandler for FailFirstNHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let prev = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            anyhow::bail!("scripted transient failure ({} left)", prev - 1)
        }
        self.successes.handle(envelope).await
    }
}
