//! v1 stream names (frozen semantics for v1).
//!
//! Stream name == schema name in this system. Schema evolution happens by
//! introducing a `.v2` stream, never by widening a v1 payload.

pub const PERCEPTION_HEARTBEAT_V1: &str = "perception.heartbeat.v1";
pub const PERCEPTION_MARKET_DATA_COLLECTED_V1: &str = "perception.market_data.collected.v1";

pub const VARIABLES_MARKET_COMPUTED_V1: &str = "variables.market.computed.v1";
pub const VARIABLES_STOCK_COMPUTED_V1: &str = "variables.stock.computed.v1";

pub const SIGNALS_REGIME_DETECTED_V1: &str = "signals.regime.detected.v1";
pub const SIGNALS_OPPORTUNITY_SCORED_V1: &str = "signals.opportunity.scored.v1";

pub const STRATEGY_CANDIDATE_ACTION_GENERATED_V1: &str = "strategy.candidate_action.generated.v1";

pub const RISK_ORDER_APPROVED_V1: &str = "risk.order.approved.v1";
pub const RISK_ORDER_REJECTED_V1: &str = "risk.order.rejected.v1";

pub const EXECUTION_ORDER_EXECUTED_V1: &str = "execution.order.executed.v1";
pub const EXECUTION_ORDER_FAILED_V1: &str = "execution.order.failed.v1";

pub const POSTMORTEM_TRADE_RECORD_CREATED_V1: &str = "postmortem.trade_record.created.v1";

pub const EVOLUTION_BACKTEST_COMPLETED_V1: &str = "evolution.backtest.completed.v1";
pub const EVOLUTION_PARAMETER_PROPOSED_V1: &str = "evolution.parameter.proposed.v1";

/// Every v1 stream, in pipeline order.
pub const ALL_V1: &[&str] = &[
    PERCEPTION_HEARTBEAT_V1,
    PERCEPTION_MARKET_DATA_COLLECTED_V1,
    VARIABLES_MARKET_COMPUTED_V1,
    VARIABLES_STOCK_COMPUTED_V1,
    SIGNALS_REGIME_DETECTED_V1,
    SIGNALS_OPPORTUNITY_SCORED_V1,
    STRATEGY_CANDIDATE_ACTION_GENERATED_V1,
    RISK_ORDER_APPROVED_V1,
    RISK_ORDER_REJECTED_V1,
    EXECUTION_ORDER_EXECUTED_V1,
    EXECUTION_ORDER_FAILED_V1,
    POSTMORTEM_TRADE_RECORD_CREATED_V1,
    EVOLUTION_BACKTEST_COMPLETED_V1,
    EVOLUTION_PARAMETER_PROPOSED_V1,
];

/// Dead-letter counterpart of a stream: `dlq.<original_stream>.v1`.
pub fn dlq_stream(base_stream: &str) -> String {
    format!("dlq.{base_stream}.v1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_v1_stream_carries_the_version_suffix() {
        for name in ALL_V1 {
            assert!(name.ends_with(".v1"), "{name} missing .v1 suffix");
        }
    }

    #[test]
    fn dlq_stream_is_derived_deterministically() {
        assert_eq!(
            dlq_stream(PERCEPTION_MARKET_DATA_COLLECTED_V1),
            "dlq.perception.market_data.collected.v1.v1"
        );
    }

    #[test]
    fn no_duplicate_stream_names() {
        let mut seen = std::collections::BTreeSet::new();
        for name in ALL_V1 {
            assert!(seen.insert(name), "duplicate stream name {name}");
        }
    }
}
