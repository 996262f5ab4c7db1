//! Poison-message containment: bodies that can never be valid are
//! quarantined immediately with a `contract_invalid` tag, acked, and never
//! reach the domain handler.

use bjk_bus::{Broker, LocalIdempotencyStore};
use bjk_schemas::streams;
use bjk_testkit::{fast_test_config, golden, memory_bus, RecordingHandler};
use serde_json::json;

const STREAM: &str = streams::VARIABLES_MARKET_COMPUTED_V1;

#[tokio::test]
async fn undecodable_body_goes_straight_to_dlq() {
    let (broker, bus) = memory_bus(fast_test_config());
    let handler = RecordingHandler::new();
    let store = LocalIdempotencyStore::new();

    bus.ensure_group(STREAM, "variables").await.unwrap();
    broker.append(STREAM, "{not valid json").await.unwrap();

    bus.run_worker(STREAM, "variables", "c1", &handler, &store, Some(1))
        .await
        .unwrap();

    assert_eq!(handler.count(), 0, "handler must never see poison");

    let dead = bus.dead_letters(STREAM, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(
        dead[0].error.starts_with("contract_invalid:"),
        "unexpected tag: {}",
        dead[0].error
    );
    assert_eq!(dead[0].event, json!("{not valid json"));
    assert_eq!(broker.pending_count(STREAM, "variables").await.unwrap(), 0);
}

#[tokio::test]
async fn stale_producer_payload_is_quarantined_not_retried() {
    let (broker, bus) = memory_bus(fast_test_config());
    let handler = RecordingHandler::new();
    let store = LocalIdempotencyStore::new();

    bus.ensure_group(STREAM, "variables").await.unwrap();

    // Parses fine but violates the contract: an old producer that still
    // sends a naive timestamp.
    let mut wire = golden(STREAM).to_wire();
    wire["produced_at"] = json!("2026-01-01T00:00:00");
    broker.append(STREAM, &wire.to_string()).await.unwrap();

    bus.run_worker(STREAM, "variables", "c1", &handler, &store, Some(1))
        .await
        .unwrap();

    assert_eq!(handler.count(), 0);
    let dead = bus.dead_letters(STREAM, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].error.starts_with("contract_invalid:"));

    // Exactly one delivery: an invalid message must not be re-published.
    assert_eq!(broker.stream_len(STREAM), 1);
}
