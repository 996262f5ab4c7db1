//! Postgres-backed bus backends for distributed deployments.
//!
//! Two things live here: [`PgBroker`] (durable streams with consumer-group
//! cursors and pending lists) and [`PgIdempotencyStore`] (atomic
//! set-if-absent dedup plus shared attempt counters). Both speak plain SQL
//! through a pool constructed explicitly at service startup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

use bjk_bus::{Broker, BusError, IdempotencyStore, RawMessage};

pub const ENV_DB_URL: &str = "BJK_DATABASE_URL";

/// Connect to Postgres using BJK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

fn db_err(context: &str, e: sqlx::Error) -> BusError {
    BusError::Broker(format!("{context}: {e}"))
}

fn expiry(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).context("ttl out of range")?;
    Ok(Utc::now() + ttl)
}

// ---------------------------------------------------------------------------
// PgBroker
// ---------------------------------------------------------------------------

/// Durable [`Broker`] over Postgres.
///
/// Group cursors are advanced under a row lock so concurrent pollers in one
/// group never double-claim; stale pending takeover uses
/// `FOR UPDATE SKIP LOCKED` so competing claimers never block each other.
/// Postgres has no blocking read, so `read_group` polls with a short sleep
/// up to the block deadline.
pub struct PgBroker {
    pool: PgPool,
}

const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_read_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawMessage>, BusError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin read_group", e))?;

        // First contact creates the cursor at the tail: a late-joining group
        // does not replay history.
        sqlx::query(
            r#"
            insert into bus_group_cursors (stream, group_name, next_seq)
            select $1, $2, coalesce((select max(seq) from bus_messages where stream = $1), 0) + 1
            on conflict (stream, group_name) do nothing
            "#,
        )
        .bind(stream)
        .bind(group)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("ensure group cursor", e))?;

        let cursor: i64 = sqlx::query(
            r#"
            select next_seq from bus_group_cursors
            where stream = $1 and group_name = $2
            for update
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("lock group cursor", e))?
        .try_get("next_seq")
        .map_err(|e| db_err("decode cursor", e))?;

        let rows = sqlx::query(
            r#"
            select seq, body from bus_messages
            where stream = $1 and seq >= $2
            order by seq
            limit $3
            "#,
        )
        .bind(stream)
        .bind(cursor)
        .bind(count.max(1) as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_err("fetch batch", e))?;

        if rows.is_empty() {
            tx.commit().await.map_err(|e| db_err("commit empty read", e))?;
            return Ok(Vec::new());
        }

        let mut batch = Vec::with_capacity(rows.len());
        let mut last_seq: i64 = cursor;
        for row in rows {
            let seq: i64 = row.try_get("seq").map_err(|e| db_err("decode seq", e))?;
            let body: String = row.try_get("body").map_err(|e| db_err("decode body", e))?;
            last_seq = seq;
            sqlx::query(
                r#"
                insert into bus_pending (stream, group_name, seq, consumer, delivered_at)
                values ($1, $2, $3, $4, now())
                on conflict (stream, group_name, seq) do nothing
                "#,
            )
            .bind(stream)
            .bind(group)
            .bind(seq)
            .bind(consumer)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("insert pending", e))?;
            batch.push(RawMessage {
                id: seq.to_string(),
                body,
            });
        }

        sqlx::query(
            r#"
            update bus_group_cursors
            set next_seq = $3
            where stream = $1 and group_name = $2
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(last_seq + 1)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("advance cursor", e))?;

        tx.commit().await.map_err(|e| db_err("commit read", e))?;
        Ok(batch)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn append(&self, stream: &str, body: &str) -> Result<String, BusError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin append", e))?;

        // Atomic per-stream sequence claim.
        let seq: i64 = sqlx::query(
            r#"
            insert into bus_stream_heads (stream, next_seq)
            values ($1, 1)
            on conflict (stream) do update set next_seq = bus_stream_heads.next_seq + 1
            returning next_seq
            "#,
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("claim stream seq", e))?
        .try_get("next_seq")
        .map_err(|e| db_err("decode seq", e))?;

        sqlx::query(
            r#"
            insert into bus_messages (stream, seq, body, appended_at)
            values ($1, $2, $3, now())
            "#,
        )
        .bind(stream)
        .bind(seq)
        .bind(body)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("append message", e))?;

        tx.commit().await.map_err(|e| db_err("commit append", e))?;
        Ok(seq.to_string())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        sqlx::query(
            r#"
            insert into bus_group_cursors (stream, group_name, next_seq)
            select $1, $2, coalesce((select max(seq) from bus_messages where stream = $1), 0) + 1
            on conflict (stream, group_name) do nothing
            "#,
        )
        .bind(stream)
        .bind(group)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("ensure_group", e))?;
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
        let deadline = std::time::Instant::now() + block;
        loop {
            let batch = self.try_read_batch(stream, group, consumer, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(READ_POLL_INTERVAL.min(block)).await;
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
        let idle = chrono::Duration::from_std(min_idle)
            .map_err(|e| BusError::Broker(format!("min_idle out of range: {e}")))?;
        let cutoff = Utc::now() - idle;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin claim_stale", e))?;

        let rows = sqlx::query(
            r#"
            select p.seq, m.body
            from bus_pending p
            join bus_messages m on m.stream = p.stream and m.seq = p.seq
            where p.stream = $1 and p.group_name = $2 and p.delivered_at < $3
            order by p.seq
            limit $4
            for update of p skip locked
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(cutoff)
        .bind(count.max(1) as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_err("select stale pending", e))?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.try_get("seq").map_err(|e| db_err("decode seq", e))?;
            let body: String = row.try_get("body").map_err(|e| db_err("decode body", e))?;
            sqlx::query(
                r#"
                update bus_pending
                set consumer = $4, delivered_at = now()
                where stream = $1 and group_name = $2 and seq = $3
                "#,
            )
            .bind(stream)
            .bind(group)
            .bind(seq)
            .bind(consumer)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("take over pending", e))?;
            batch.push(RawMessage {
                id: seq.to_string(),
                body,
            });
        }

        tx.commit().await.map_err(|e| db_err("commit claim_stale", e))?;
        Ok(batch)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<(), BusError> {
        // Unknown or already-acked ids are a no-op.
        let Ok(seq) = message_id.parse::<i64>() else {
            return Ok(());
        };
        sqlx::query(
            r#"
            delete from bus_pending
            where stream = $1 and group_name = $2 and seq = $3
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(seq)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("ack", e))?;
        Ok(())
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<RawMessage>, BusError> {
        let rows = sqlx::query(
            r#"
            select seq, body from bus_messages
            where stream = $1
            order by seq
            limit $2
            "#,
        )
        .bind(stream)
        .bind(count.max(1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("range", e))?;

        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.try_get("seq").map_err(|e| db_err("decode seq", e))?;
                let body: String = row.try_get("body").map_err(|e| db_err("decode body", e))?;
                Ok(RawMessage {
                    id: seq.to_string(),
                    body,
                })
            })
            .collect()
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, BusError> {
        let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
            r#"
            select count(*)::bigint from bus_pending
            where stream = $1 and group_name = $2
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("pending_count", e))?;
        Ok(n as usize)
    }
}

// ---------------------------------------------------------------------------
// PgIdempotencyStore
// ---------------------------------------------------------------------------

/// Shared [`IdempotencyStore`] namespaced by (stream, group).
///
/// `mark` is a single `INSERT .. ON CONFLICT DO NOTHING`: two workers racing
/// on one event_id cannot both conclude they are first. `seen` is a plain
/// existence check that ignores expired rows and sweeps them
/// opportunistically.
pub struct PgIdempotencyStore {
    pool: PgPool,
    namespace: String,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool, stream: &str, group: &str) -> Self {
        Self {
            pool,
            namespace: format!("{stream}:{group}"),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn seen(&self, event_id: &str) -> Result<bool> {
        sqlx::query(
            r#"
            delete from processed_events
            where namespace = $1 and expires_at <= now()
            "#,
        )
        .bind(&self.namespace)
        .execute(&self.pool)
        .await
        .context("sweep expired processed_events")?;

        let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
            r#"
            select exists (
                select 1 from processed_events
                where namespace = $1 and event_id = $2 and expires_at > now()
            )
            "#,
        )
        .bind(&self.namespace)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .context("seen lookup failed")?;
        Ok(exists)
    }

    async fn mark(&self, event_id: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            insert into processed_events (namespace, event_id, expires_at)
            values ($1, $2, $3)
            on conflict (namespace, event_id) do nothing
            "#,
        )
        .bind(&self.namespace)
        .bind(event_id)
        .bind(expiry(ttl)?)
        .execute(&self.pool)
        .await
        .context("mark failed")?;
        Ok(())
    }

    async fn incr_attempt(&self, event_id: &str, ttl: Duration) -> Result<u64> {
        let (attempts,): (i64,) = sqlx::query_as::<_, (i64,)>(
            r#"
            insert into delivery_attempts (namespace, event_id, attempts, expires_at)
            values ($1, $2, 1, $3)
            on conflict (namespace, event_id) do update
            set attempts = case
                    when delivery_attempts.expires_at <= now() then 1
                    else delivery_attempts.attempts + 1
                end,
                expires_at = $3
            returning attempts
            "#,
        )
        .bind(&self.namespace)
        .bind(event_id)
        .bind(expiry(ttl)?)
        .fetch_one(&self.pool)
        .await
        .context("incr_attempt failed")?;
        Ok(attempts as u64)
    }
}
