//! A transient failure: one failed attempt, then success on redelivery. The
//! event is marked seen exactly once and never touches the dead-letter
//! stream.

use bjk_bus::{Broker, IdempotencyStore, LocalIdempotencyStore};
use bjk_schemas::streams;
use bjk_testkit::{fast_test_config, golden, memory_bus, FailFirstNHandler};

const STREAM: &str = streams::STRATEGY_CANDIDATE_ACTION_GENERATED_V1;

#[tokio::test]
async fn transient_failure_recovers_without_dead_lettering() {
    let (broker, bus) = memory_bus(fast_test_config());
    let handler = FailFirstNHandler::new(1);
    let store = LocalIdempotencyStore::new();

    bus.ensure_group(STREAM, "strategy").await.unwrap();
    let event = golden(STREAM);
    bus.publish(STREAM, &event).await.unwrap();

    // Two deliveries: the failing original, then the successful retry.
    bus.run_worker(STREAM, "strategy", "c1", &handler, &store, Some(2))
        .await
        .unwrap();

    assert_eq!(handler.success_count(), 1);
    assert_eq!(handler.successes()[0].event_id, event.event_id);

    assert!(store.seen(&event.event_id).await.unwrap());
    assert!(bus.dead_letters(STREAM, 10).await.unwrap().is_empty());
    assert_eq!(broker.pending_count(STREAM, "strategy").await.unwrap(), 0);

    // The retry re-entered through the stream tail: original + re-publish.
    assert_eq!(broker.stream_len(STREAM), 2);
}
