//! Shared rate-limit counter queries.
//!
//! Counters are fixed windows keyed by `(bucket, identity)`. Every mutation
//! is one upsert statement, so concurrent processes sharing the database see
//! a consistent count.

use super::db::{DatabaseError, KeyDatabase};

/// Counter value after (or instead of) an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct CounterState {
    pub count: i64,
    pub reset_at: i64,
}

impl KeyDatabase {
    /// Count one request if the bucket still has room.
    ///
    /// An elapsed window restarts at 1. Otherwise the counter is incremented
    /// but saturates at `max + 1`, so the caller is allowed iff the returned
    /// count is `<= max`.
    pub async fn hit_counter(
        &self,
        bucket: &str,
        identity: &str,
        max: i64,
        window_secs: i64,
        now: i64,
    ) -> Result<CounterState, DatabaseError> {
        let state = sqlx::query_as::<_, CounterState>(
            "INSERT INTO rate_limits (bucket, identity, count, reset_at) VALUES (?1, ?2, 1, ?3 + ?4) \
             ON CONFLICT(bucket, identity) DO UPDATE SET \
               count = CASE WHEN rate_limits.reset_at <= ?3 THEN 1 \
                            ELSE MIN(rate_limits.count + 1, ?5 + 1) END, \
               reset_at = CASE WHEN rate_limits.reset_at <= ?3 THEN excluded.reset_at \
                               ELSE rate_limits.reset_at END \
             RETURNING count, reset_at",
        )
        .bind(bucket)
        .bind(identity)
        .bind(now)
        .bind(window_secs)
        .bind(max)
        .fetch_one(self.pool())
        .await?;

        Ok(state)
    }

    /// Unconditionally count one request, opening a window if needed.
    pub async fn track_counter(
        &self,
        bucket: &str,
        identity: &str,
        window_secs: i64,
        now: i64,
    ) -> Result<CounterState, DatabaseError> {
        let state = sqlx::query_as::<_, CounterState>(
            "INSERT INTO rate_limits (bucket, identity, count, reset_at) VALUES (?1, ?2, 1, ?3 + ?4) \
             ON CONFLICT(bucket, identity) DO UPDATE SET \
               count = CASE WHEN rate_limits.reset_at <= ?3 THEN 1 \
                            ELSE rate_limits.count + 1 END, \
               reset_at = CASE WHEN rate_limits.reset_at <= ?3 THEN excluded.reset_at \
                               ELSE rate_limits.reset_at END \
             RETURNING count, reset_at",
        )
        .bind(bucket)
        .bind(identity)
        .bind(now)
        .bind(window_secs)
        .fetch_one(self.pool())
        .await?;

        Ok(state)
    }

    /// Current counter, or `None` when absent or its window has elapsed.
    pub async fn get_counter(
        &self,
        bucket: &str,
        identity: &str,
        now: i64,
    ) -> Result<Option<CounterState>, DatabaseError> {
        let state = sqlx::query_as::<_, CounterState>(
            "SELECT count, reset_at FROM rate_limits WHERE bucket = ? AND identity = ? AND reset_at > ?",
        )
        .bind(bucket)
        .bind(identity)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        Ok(state)
    }

    /// Remove a counter entirely.
    pub async fn delete_counter(&self, bucket: &str, identity: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE bucket = ? AND identity = ?")
            .bind(bucket)
            .bind(identity)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop counters whose window has elapsed.
    pub async fn purge_expired_counters(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE reset_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }
}
