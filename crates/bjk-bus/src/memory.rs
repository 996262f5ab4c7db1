//! In-memory broker: correct within a single process, the backend for tests
//! and non-distributed deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::broker::{Broker, BusError, RawMessage};

struct PendingEntry {
    index: usize,
    #[allow(dead_code)]
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Index into `StreamState::entries` of the next never-delivered entry.
    next_index: usize,
    /// message_id → delivered-but-unacked entry.
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<RawMessage>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

/// Process-local [`Broker`]. All state behind one mutex (never held across
/// an await); appends wake blocked readers through a [`Notify`].
#[derive(Default)]
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries ever appended to a stream (acked or not).
    pub fn stream_len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().expect("memory broker poisoned");
        streams.get(stream).map_or(0, |s| s.entries.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().expect("memory broker poisoned")
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(&self, stream: &str, body: &str) -> Result<String, BusError> {
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let id = format!("{}-0", state.next_seq);
            state.entries.push(RawMessage {
                id: id.clone(),
                body: body.to_string(),
            });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut streams = self.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let tail = state.entries.len();
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                next_index: tail,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawMessage>, BusError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut streams = self.lock();
                let state = streams.entry(stream.to_string()).or_default();
                let tail = state.entries.len();
                let group_state = state
                    .groups
                    .entry(group.to_string())
                    // First contact: cursor starts at the tail, so a
                    // late-joining group does not replay full history.
                    .or_insert_with(|| GroupState {
                        next_index: tail,
                        pending: HashMap::new(),
                    });

                if group_state.next_index < tail {
                    let upto = (group_state.next_index + count.max(1)).min(tail);
                    let mut batch = Vec::with_capacity(upto - group_state.next_index);
                    for index in group_state.next_index..upto {
                        let entry = state.entries[index].clone();
                        group_state.pending.insert(
                            entry.id.clone(),
                            PendingEntry {
                                index,
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                            },
                        );
                        batch.push(entry);
                    }
                    group_state.next_index = upto;
                    return Ok(batch);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // A missed wakeup only costs the bounded wait; the caller's poll
            // loop re-enters anyway.
            let _ = tokio::time::timeout(remaining, self.appended.notified()).await;
        }
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<RawMessage>, BusError> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut stale: Vec<(usize, String)> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, p)| (p.index, id.clone()))
            .collect();
        stale.sort_unstable();
        stale.truncate(count.max(1));

        let mut batch = Vec::with_capacity(stale.len());
        for (index, id) in stale {
            if let Some(p) = group_state.pending.get_mut(&id) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
            }
            batch.push(state.entries[index].clone());
        }
        Ok(batch)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<(), BusError> {
        let mut streams = self.lock();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(message_id);
            }
        }
        Ok(())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<RawMessage>, BusError> {
        let streams = self.lock();
        Ok(streams
            .get(stream)
            .map(|s| s.entries.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, BusError> {
        let streams = self.lock();
        Ok(streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len()))
    }
}
