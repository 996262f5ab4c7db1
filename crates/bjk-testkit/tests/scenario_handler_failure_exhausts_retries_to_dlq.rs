//! A handler that always fails: after exactly max_attempts deliveries of the
//! same event_id, the message lands on the dead-letter stream tagged
//! `handler_failed_after_<max_attempts>` and the group's pending list is
//! empty.

use bjk_bus::{Broker, IdempotencyStore, LocalIdempotencyStore};
use bjk_schemas::streams;
use bjk_testkit::{fast_test_config, golden, memory_bus, AlwaysFailHandler};

const STREAM: &str = streams::SIGNALS_REGIME_DETECTED_V1;

#[tokio::test]
async fn poisoned_handler_exhausts_attempts_then_dead_letters() {
    let config = fast_test_config();
    let max_attempts = config.max_attempts as usize;
    let (broker, bus) = memory_bus(config);

    let handler = AlwaysFailHandler::new();
    let store = LocalIdempotencyStore::new();

    bus.ensure_group(STREAM, "signals").await.unwrap();
    let event = golden(STREAM);
    bus.publish(STREAM, &event).await.unwrap();

    // One dispatch per delivery: the original plus each re-publish.
    bus.run_worker(STREAM, "signals", "c1", &handler, &store, Some(max_attempts))
        .await
        .unwrap();

    assert_eq!(handler.invocations(), max_attempts);

    let dead = bus.dead_letters(STREAM, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(
        dead[0]
            .error
            .starts_with(&format!("handler_failed_after_{max_attempts}")),
        "unexpected tag: {}",
        dead[0].error
    );
    assert_eq!(dead[0].original_stream, STREAM);
    assert_eq!(dead[0].event["event_id"], event.event_id.as_str());

    // Every delivery left the pending list.
    assert_eq!(broker.pending_count(STREAM, "signals").await.unwrap(), 0);

    // The id was never marked seen — it never succeeded.
    assert!(!store.seen(&event.event_id).await.unwrap());
}
