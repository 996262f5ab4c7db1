//! Two distinct broker messages carrying the same event_id: the handler runs
//! exactly once; the duplicate is acked without invocation.

use bjk_bus::{Broker, LocalIdempotencyStore};
use bjk_schemas::streams;
use bjk_testkit::{fast_test_config, golden, memory_bus, RecordingHandler};

const STREAM: &str = streams::EXECUTION_ORDER_EXECUTED_V1;

#[tokio::test]
async fn duplicate_delivery_is_suppressed_by_the_idempotency_store() {
    let (broker, bus) = memory_bus(fast_test_config());
    let handler = RecordingHandler::new();
    let store = LocalIdempotencyStore::new();

    bus.ensure_group(STREAM, "postmortem").await.unwrap();
    let event = golden(STREAM);
    // Same envelope published twice: two broker message ids, one event_id.
    let first = bus.publish(STREAM, &event).await.unwrap();
    let second = bus.publish(STREAM, &event).await.unwrap();
    assert_ne!(first, second);

    bus.run_worker(STREAM, "postmortem", "c1", &handler, &store, Some(2))
        .await
        .unwrap();

    assert_eq!(handler.count(), 1);
    assert_eq!(broker.pending_count(STREAM, "postmortem").await.unwrap(), 0);
    assert!(bus.dead_letters(STREAM, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn same_event_id_is_tracked_independently_per_group() {
    let (_broker, bus) = memory_bus(fast_test_config());
    for group in ["risk", "postmortem"] {
        bus.ensure_group(STREAM, group).await.unwrap();
    }
    let event = golden(STREAM);
    bus.publish(STREAM, &event).await.unwrap();

    // Each group owns its own idempotency namespace: a store per group.
    for group in ["risk", "postmortem"] {
        let handler = RecordingHandler::new();
        let store = LocalIdempotencyStore::new();
        bus.run_worker(STREAM, group, "c1", &handler, &store, Some(1))
            .await
            .unwrap();
        assert_eq!(handler.count(), 1, "group {group} missed the event");
    }
}
