//! Deployment-time knobs for the bus and its dispatch loop.

use std::time::Duration;

/// Tunables with conservative defaults. Env overrides use the `BJK_` prefix;
/// unset or unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Upper bound a poll blocks waiting for entries.
    pub block: Duration,
    /// Max entries claimed per poll.
    pub batch_size: usize,
    /// Handler attempts per event_id before dead-lettering.
    pub max_attempts: u32,
    /// Fixed pause before a failed event is re-published.
    pub retry_backoff: Duration,
    /// How long a processed event_id suppresses duplicates. Must stay
    /// generous relative to the redelivery window plus retry backoff.
    pub idempotency_ttl: Duration,
    /// Horizon for per-event attempt counters. Decoupled from
    /// `idempotency_ttl` so operators can bound memory under failure storms
    /// without touching dedup safety; same default.
    pub attempt_ttl: Duration,
    /// Pending entries idle this long are presumed orphaned and re-claimed.
    pub claim_min_idle: Duration,
}

const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            block: Duration::from_secs(5),
            batch_size: 16,
            max_attempts: 5,
            retry_backoff: Duration::from_millis(500),
            idempotency_ttl: SEVEN_DAYS,
            attempt_ttl: SEVEN_DAYS,
            claim_min_idle: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            block: env_millis("BJK_POLL_BLOCK_MS").unwrap_or(d.block),
            batch_size: env_parse("BJK_BATCH_SIZE").unwrap_or(d.batch_size),
            max_attempts: env_parse("BJK_MAX_ATTEMPTS").unwrap_or(d.max_attempts),
            retry_backoff: env_millis("BJK_RETRY_BACKOFF_MS").unwrap_or(d.retry_backoff),
            idempotency_ttl: env_secs("BJK_IDEMPOTENCY_TTL_SECS").unwrap_or(d.idempotency_ttl),
            attempt_ttl: env_secs("BJK_ATTEMPT_TTL_SECS").unwrap_or(d.attempt_ttl),
            claim_min_idle: env_millis("BJK_CLAIM_MIN_IDLE_MS").unwrap_or(d.claim_min_idle),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
