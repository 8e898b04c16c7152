use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;

use super::counter::{AttemptKey, CounterStore, FailedAttemptCounter, LockoutPolicy, apply_failure};
use super::rate_limit::{RateLimit, RateLimitDecision, RateLimitStore, retry_after};

fn counter_value(count: i32) -> u32 {
    u32::try_from(count).unwrap_or(0)
}

/// Counters in the `failed_attempts` table; the row lock taken inside the
/// transaction serializes concurrent failures for one key.
#[derive(Debug, Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn record_failure(
        &self,
        key: &AttemptKey,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailedAttemptCounter> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        // Make sure a row exists so the FOR UPDATE below always has something to lock.
        let seed = r"
            INSERT INTO failed_attempts (attempt_key, purpose, count, window_start)
            VALUES ($1, $2, 0, $3)
            ON CONFLICT (attempt_key, purpose) DO NOTHING
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = seed
        );
        sqlx::query(seed)
            .bind(&key.subject)
            .bind(key.purpose.as_str())
            .bind(now)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to seed attempt counter")?;

        let select = r"
            SELECT count, window_start, locked_until
            FROM failed_attempts
            WHERE attempt_key = $1 AND purpose = $2
            FOR UPDATE
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = select
        );
        let row = sqlx::query(select)
            .bind(&key.subject)
            .bind(key.purpose.as_str())
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock attempt counter")?;
        let existing = FailedAttemptCounter {
            count: counter_value(row.get("count")),
            window_start: row.get("window_start"),
            locked_until: row.get("locked_until"),
        };

        let next = apply_failure(Some(&existing), policy, now);

        let update = r"
            UPDATE failed_attempts
            SET count = $3, window_start = $4, locked_until = $5, updated_at = $6
            WHERE attempt_key = $1 AND purpose = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = update
        );
        sqlx::query(update)
            .bind(&key.subject)
            .bind(key.purpose.as_str())
            .bind(i32::try_from(next.count).unwrap_or(i32::MAX))
            .bind(next.window_start)
            .bind(next.locked_until)
            .bind(now)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to update attempt counter")?;

        tx.commit().await.context("failed to commit attempt counter")?;
        Ok(next)
    }

    async fn get(&self, key: &AttemptKey) -> Result<Option<FailedAttemptCounter>> {
        let query = r"
            SELECT count, window_start, locked_until
            FROM failed_attempts
            WHERE attempt_key = $1 AND purpose = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&key.subject)
            .bind(key.purpose.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to read attempt counter")?;

        Ok(row.map(|row| FailedAttemptCounter {
            count: counter_value(row.get("count")),
            window_start: row.get("window_start"),
            locked_until: row.get("locked_until"),
        }))
    }

    async fn reset(&self, key: &AttemptKey) -> Result<()> {
        let query = "DELETE FROM failed_attempts WHERE attempt_key = $1 AND purpose = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&key.subject)
            .bind(key.purpose.as_str())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to reset attempt counter")?;
        Ok(())
    }
}

/// Sliding-window log in `rate_limit_hits`, serialized per bucket with a
/// transaction-scoped advisory lock.
#[derive(Debug, Clone)]
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn hit(
        &self,
        bucket: &str,
        limit: &RateLimit,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(bucket)
            .execute(&mut *tx)
            .await
            .context("failed to lock rate limit bucket")?;

        let prune = "DELETE FROM rate_limit_hits WHERE bucket = $1 AND hit_at <= $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = prune
        );
        sqlx::query(prune)
            .bind(bucket)
            .bind(now - limit.window)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to prune rate limit hits")?;

        let count = r"
            SELECT COUNT(*) AS hits, MIN(hit_at) AS oldest
            FROM rate_limit_hits
            WHERE bucket = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = count
        );
        let row = sqlx::query(count)
            .bind(bucket)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to count rate limit hits")?;
        let hits: i64 = row.get("hits");
        let oldest: Option<DateTime<Utc>> = row.get("oldest");

        if hits >= i64::from(limit.max_hits) {
            tx.commit().await.context("failed to commit rate limit check")?;
            return Ok(RateLimitDecision::Limited {
                retry_after_seconds: retry_after(oldest.unwrap_or(now), limit, now),
            });
        }

        let insert = "INSERT INTO rate_limit_hits (bucket, hit_at) VALUES ($1, $2)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = insert
        );
        sqlx::query(insert)
            .bind(bucket)
            .bind(now)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to record rate limit hit")?;

        tx.commit().await.context("failed to commit rate limit hit")?;
        Ok(RateLimitDecision::Allowed)
    }
}
