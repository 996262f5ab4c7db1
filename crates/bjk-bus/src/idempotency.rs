//! Tracks which event ids a (stream, group) pair has already processed.
//!
//! The store is constructed per worker, one namespace per (stream, group):
//! the same event_id on different streams or groups is tracked
//! independently. `mark` must be atomic on shared backends so two workers
//! racing on one event_id cannot both conclude they are first — see
//! `bjk-db` for the Postgres implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Contract: if `seen(event_id)` is true the event must be treated as
/// already processed. Attempt counters live behind the same backend because
/// racing workers must share them too.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn seen(&self, event_id: &str) -> anyhow::Result<bool>;

    /// Record first successful processing. Set-if-absent with expiry.
    async fn mark(&self, event_id: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Bump and return the delivery-attempt count for an event id. The
    /// counter expires on its own horizon to bound memory under storms of
    /// distinct failing events.
    async fn incr_attempt(&self, event_id: &str, ttl: Duration) -> anyhow::Result<u64>;
}

#[derive(Default)]
struct LocalState {
    /// event_id → expiry.
    seen: HashMap<String, Instant>,
    /// event_id → (attempts, expiry).
    attempts: HashMap<String, (u64, Instant)>,
}

/// Process-local store with a lazy expiry sweep on each `seen` call.
/// Correct only within a single process: tests and non-distributed
/// deployments.
#[derive(Default)]
pub struct LocalIdempotencyStore {
    inner: Mutex<LocalState>,
}

impl LocalIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency store poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for LocalIdempotencyStore {
    async fn seen(&self, event_id: &str) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("idempotency store poisoned");
        state.seen.retain(|_, expiry| *expiry > now);
        state.attempts.retain(|_, (_, expiry)| *expiry > now);
        Ok(state.seen.contains_key(event_id))
    }

    async fn mark(&self, event_id: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut state = self.inner.lock().expect("idempotency store poisoned");
        state
            .seen
            .entry(event_id.to_string())
            .or_insert(Instant::now() + ttl);
        Ok(())
    }

    async fn incr_attempt(&self, event_id: &str, ttl: Duration) -> anyhow::Result<u64> {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("idempotency store poisoned");
        let slot = state
            .attempts
            .entry(event_id.to_string())
            .or_insert((0, now + ttl));
        if slot.1 <= now {
            *slot = (0, now + ttl);
        }
        slot.0 += 1;
        slot.1 = now + ttl;
        Ok(slot.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marked_id_is_seen_until_ttl_expires() {
        let store = LocalIdempotencyStore::new();
        assert!(!store.seen("X").await.unwrap());

        store.mark("X", Duration::from_millis(40)).await.unwrap();
        assert!(store.seen("X").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.seen("X").await.unwrap());
    }

    #[tokio::test]
    async fn ids_are_tracked_independently() {
        let store = LocalIdempotencyStore::new();
        store.mark("a", Duration::from_secs(60)).await.unwrap();
        assert!(store.seen("a").await.unwrap());
        assert!(!store.seen("b").await.unwrap());
    }

    #[tokio::test]
    async fn attempts_count_up_per_id() {
        let store = LocalIdempotencyStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_attempt("e", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_attempt("e", ttl).await.unwrap(), 2);
        assert_eq!(store.incr_attempt("other", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_attempt_counter_restarts_at_one() {
        let store = LocalIdempotencyStore::new();
        let ttl = Duration::from_millis(30);
        assert_eq!(store.incr_attempt("e", ttl).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.incr_attempt("e", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_seen_entries_are_swept_lazily() {
        let store = LocalIdempotencyStore::new();
        store.mark("short", Duration::from_millis(20)).await.unwrap();
        store.mark("long", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.seen("long").await.unwrap());
        assert_eq!(store.len(), 1);
    }
}
