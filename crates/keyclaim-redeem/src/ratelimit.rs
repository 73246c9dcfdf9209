//! Store-backed, multi-bucket rate limiting.
//!
//! Each named bucket is a fixed window `(max_requests, window_secs)` counted
//! per identity in the shared `rate_limits` table. Nothing is kept in
//! process memory, so every instance sharing the database enforces the same
//! limits.
//!
//! Three operations are exposed:
//! - [`Limiter::limit`] counts a request if the bucket has room,
//! - [`RateLimitService::track_request`] counts unconditionally, for flows
//!   that check first and consume only once a side effect has happened,
//! - [`RateLimitService::delete_request`] drops the counter to refund an
//!   attempt whose downstream step failed.
//!
//! If the counter store cannot be reached, limiters deny.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use keyclaim_core::Clock;
use keyclaim_core::config::BucketConfig;
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::{CounterState, DatabaseError, KeyDatabase};

/// Bucket names used across the service.
pub mod buckets {
    pub const REDEEM_KEY: &str = "redeemkey";
    pub const HWID_RESET_REQUEST: &str = "hwidreset_request";
    pub const HWID_RESET_SUCCESS: &str = "hwidreset_success";
    pub const BUG_REPORTS: &str = "bugreports";
    pub const SUGGESTIONS: &str = "suggestions";
    pub const SYNC_USER: &str = "syncuser";
}

/// Identity used for system-wide counters such as `syncuser`.
pub const SYSTEM_IDENTITY: &str = "system";

/// Applied to bucket names missing from the table.
const FALLBACK_BUCKET: BucketConfig = BucketConfig {
    max_requests: 1,
    window_secs: 60,
};

/// Built-in bucket table. Config entries override these per name.
pub fn default_buckets() -> BTreeMap<String, BucketConfig> {
    let table = [
        (buckets::REDEEM_KEY, 5, 5 * 60),
        (buckets::HWID_RESET_REQUEST, 1, 30 * 60),
        (buckets::HWID_RESET_SUCCESS, 1, 6 * 60 * 60),
        (buckets::BUG_REPORTS, 1, 10 * 60),
        (buckets::SUGGESTIONS, 1, 10 * 60),
        (buckets::SYNC_USER, 300, 60),
    ];
    table
        .into_iter()
        .map(|(name, max_requests, window_secs)| {
            (
                name.to_string(),
                BucketConfig {
                    max_requests,
                    window_secs,
                },
            )
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    /// Epoch second at which the current window ends.
    pub reset_at: i64,
    /// Requests left in the window after this decision.
    pub remaining: u32,
}

impl LimitDecision {
    /// Seconds until the window resets, never negative.
    pub fn retry_after(&self, now: i64) -> i64 {
        (self.reset_at - now).max(0)
    }
}

/// Owns the bucket table and the counter store.
#[derive(Clone)]
pub struct RateLimitService {
    db: KeyDatabase,
    clock: Arc<dyn Clock>,
    buckets: Arc<HashMap<String, BucketConfig>>,
}

impl RateLimitService {
    /// Build the service from the built-in table plus `overrides`.
    pub fn new(
        db: KeyDatabase,
        clock: Arc<dyn Clock>,
        overrides: &BTreeMap<String, BucketConfig>,
    ) -> Self {
        let mut table = default_buckets();
        table.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));

        Self {
            db,
            clock,
            buckets: Arc::new(table.into_iter().collect()),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Configuration for `bucket`, falling back to a strict default.
    pub fn bucket_config(&self, bucket: &str) -> BucketConfig {
        self.buckets.get(bucket).copied().unwrap_or_else(|| {
            warn!(bucket, "Unknown rate limit bucket, using fallback limits");
            FALLBACK_BUCKET
        })
    }

    pub fn limiter(&self, bucket: &str) -> Limiter<'_> {
        Limiter {
            service: self,
            bucket: bucket.to_string(),
            config: self.bucket_config(bucket),
        }
    }

    /// Count one request against `bucket` regardless of its limit.
    pub async fn track_request(
        &self,
        bucket: &str,
        identity: &str,
    ) -> Result<CounterState, RateLimitError> {
        let config = self.bucket_config(bucket);
        let state = self
            .db
            .track_counter(bucket, identity, config.window_secs, self.clock.now())
            .await?;
        debug!(bucket, identity, count = state.count, "Request tracked");
        Ok(state)
    }

    /// Remove the counter so the next check behaves as a first request.
    pub async fn delete_request(&self, bucket: &str, identity: &str) -> Result<(), RateLimitError> {
        let removed = self.db.delete_counter(bucket, identity).await?;
        debug!(bucket, identity, removed, "Request counter deleted");
        Ok(())
    }

    /// Drop counters whose window has elapsed.
    pub async fn purge_expired(&self) -> Result<u64, RateLimitError> {
        Ok(self.db.purge_expired_counters(self.clock.now()).await?)
    }
}

/// A handle on one bucket.
pub struct Limiter<'a> {
    service: &'a RateLimitService,
    bucket: String,
    config: BucketConfig,
}

impl Limiter<'_> {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub const fn config(&self) -> BucketConfig {
        self.config
    }

    /// Count a request for `identity` if the window has room.
    pub async fn limit(&self, identity: &str) -> LimitDecision {
        let now = self.service.clock.now();
        let max = i64::from(self.config.max_requests);

        match self
            .service
            .db
            .hit_counter(&self.bucket, identity, max, self.config.window_secs, now)
            .await
        {
            Ok(state) => {
                let decision = decide(state, max);
                if !decision.allowed {
                    debug!(bucket = %self.bucket, identity, reset_at = decision.reset_at, "Rate limited");
                }
                decision
            }
            Err(e) => self.fail_closed(identity, now, &e),
        }
    }

    /// Report whether the next `limit` call would pass, without counting.
    pub async fn check(&self, identity: &str) -> LimitDecision {
        let now = self.service.clock.now();
        let max = i64::from(self.config.max_requests);

        match self.service.db.get_counter(&self.bucket, identity, now).await {
            Ok(Some(state)) => {
                let remaining = (max - state.count).max(0);
                LimitDecision {
                    allowed: state.count < max,
                    reset_at: state.reset_at,
                    remaining: clamp_u32(remaining),
                }
            }
            Ok(None) => LimitDecision {
                allowed: true,
                reset_at: now + self.config.window_secs,
                remaining: self.config.max_requests,
            },
            Err(e) => self.fail_closed(identity, now, &e),
        }
    }

    fn fail_closed(&self, identity: &str, now: i64, error: &DatabaseError) -> LimitDecision {
        warn!(
            bucket = %self.bucket,
            identity,
            error = %error,
            "Rate limit store unavailable, denying request"
        );
        LimitDecision {
            allowed: false,
            reset_at: now + self.config.window_secs,
            remaining: 0,
        }
    }
}

fn decide(state: CounterState, max: i64) -> LimitDecision {
    LimitDecision {
        allowed: state.count <= max,
        reset_at: state.reset_at,
        remaining: clamp_u32((max - state.count).max(0)),
    }
}

fn clamp_u32(n: i64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Render a wait in seconds as e.g. `"1 hour 2 minutes 3 seconds"`.
pub fn format_wait(secs: i64) -> String {
    let secs = secs.max(0);
    let hours = secs / 3600;
    let minutes = (secs / 60) % 60;
    let seconds = secs % 60;

    let mut parts = Vec::new();
    for (value, unit) in [(hours, "hour"), (minutes, "minute"), (seconds, "second")] {
        if value > 0 {
            let plural = if value == 1 { "" } else { "s" };
            parts.push(format!("{value} {unit}{plural}"));
        }
    }

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(" ")
    }
}
