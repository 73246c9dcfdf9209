//! Key pool queries: insertion, lookup, and the reserve/finalize claim protocol.
//!
//! Both protocol steps are single conditional `UPDATE ... RETURNING`
//! statements. `SQLite` executes each atomically, so the statement itself is
//! the linearization point for competing callers on the same serial.

use tracing::debug;

use super::db::{DatabaseError, KeyDatabase};
use super::models::{KeyRecord, KeyStats};
use crate::interval::parse_interval;

/// Parameters for adding a serial to the pool.
#[derive(Debug, Clone)]
pub struct NewKey<'a> {
    pub serial: &'a str,
    pub order_id: &'a str,
    pub key_duration: Option<&'a str>,
}

/// A lease won by `try_reserve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub record: KeyRecord,
    /// The exact `reserved_until` written by this reservation.
    pub fencing_token: i64,
}

/// Outcome of [`KeyDatabase::try_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationResult {
    Reserved(Reservation),
    NotFound,
    AlreadyClaimed { linked_to: String },
    /// The caller's own earlier reservation is still live.
    StillBeingClaimed { reserved_until: i64 },
    ReservedByOther { reserved_until: i64 },
}

/// Outcome of [`KeyDatabase::finalize_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed(KeyRecord),
    /// Already claimed by the same identity; replays land here.
    AlreadyClaimed(KeyRecord),
    NotFound,
    /// The lease was taken over, or the key was claimed by someone else.
    LeaseLost(KeyRecord),
}

impl KeyDatabase {
    /// Add a serial to the pool.
    pub async fn insert_key(&self, key: &NewKey<'_>, now: i64) -> Result<KeyRecord, DatabaseError> {
        if key.serial.is_empty() {
            return Err(DatabaseError::Invalid("serial is empty".into()));
        }
        if let Some(duration) = key.key_duration {
            parse_interval(duration)
                .map_err(|e| DatabaseError::Invalid(format!("key_duration {duration:?}: {e}")))?;
        }

        sqlx::query(
            "INSERT INTO serial_keys (serial, order_id, key_duration, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(key.serial)
        .bind(key.order_id)
        .bind(key.key_duration)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_key(key.serial)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Key {}", key.serial)))
    }

    /// Point read by serial.
    pub async fn get_key(&self, serial: &str) -> Result<Option<KeyRecord>, DatabaseError> {
        let key = sqlx::query_as::<_, KeyRecord>("SELECT * FROM serial_keys WHERE serial = ?")
            .bind(serial)
            .fetch_optional(self.pool())
            .await?;

        Ok(key)
    }

    /// Keys claimed by an identity, most recent first.
    pub async fn keys_linked_to(&self, identity: &str) -> Result<Vec<KeyRecord>, DatabaseError> {
        let keys = sqlx::query_as::<_, KeyRecord>(
            "SELECT * FROM serial_keys WHERE linked_to = ? ORDER BY claimed_at DESC",
        )
        .bind(identity)
        .fetch_all(self.pool())
        .await?;

        Ok(keys)
    }

    /// Unclaimed keys, oldest first.
    pub async fn list_unclaimed(&self, limit: u32) -> Result<Vec<KeyRecord>, DatabaseError> {
        let keys = sqlx::query_as::<_, KeyRecord>(
            "SELECT * FROM serial_keys WHERE claimed_at IS NULL ORDER BY created_at ASC, serial ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(keys)
    }

    /// Pool totals, with leases evaluated at `now`.
    pub async fn key_stats(&self, now: i64) -> Result<KeyStats, DatabaseError> {
        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(claimed_at IS NOT NULL), 0), \
                    COALESCE(SUM(claimed_at IS NULL AND reserved_until >= ?), 0) \
             FROM serial_keys",
        )
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(KeyStats {
            total: row.0,
            claimed: row.1,
            reserved: row.2,
        })
    }

    /// Take a lease on an unclaimed serial.
    ///
    /// Succeeds only when the serial is unclaimed and no live lease exists.
    /// A lease held by the same identity blocks as well until it expires, so
    /// a caller never holds two overlapping fencing tokens.
    pub async fn try_reserve(
        &self,
        serial: &str,
        identity: &str,
        now: i64,
        lease_secs: i64,
    ) -> Result<ReservationResult, DatabaseError> {
        let reserved_until = now + lease_secs;

        let won = sqlx::query_as::<_, KeyRecord>(
            "UPDATE serial_keys \
             SET reserved_to = ?1, reserved_until = ?2 \
             WHERE serial = ?3 \
               AND claimed_at IS NULL \
               AND (reserved_to IS NULL OR reserved_to = ?1 OR reserved_until < ?4) \
               AND (reserved_until IS NULL OR reserved_until < ?4) \
             RETURNING *",
        )
        .bind(identity)
        .bind(reserved_until)
        .bind(serial)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        if let Some(record) = won {
            debug!(serial, identity, reserved_until, "Lease acquired");
            return Ok(ReservationResult::Reserved(Reservation {
                record,
                fencing_token: reserved_until,
            }));
        }

        let Some(current) = self.get_key(serial).await? else {
            return Ok(ReservationResult::NotFound);
        };

        Ok(classify_conflict(&current, identity))
    }

    /// Permanently assign a reserved serial to `identity`.
    ///
    /// The write only lands if the row still carries this caller's lease
    /// with the exact fencing token, so a holder whose lease was taken over
    /// after expiry can never claim.
    pub async fn finalize_claim(
        &self,
        serial: &str,
        identity: &str,
        fencing_token: i64,
        now: i64,
    ) -> Result<ClaimResult, DatabaseError> {
        let claimed = sqlx::query_as::<_, KeyRecord>(
            "UPDATE serial_keys \
             SET claimed_at = ?1, linked_to = ?2 \
             WHERE serial = ?3 \
               AND claimed_at IS NULL \
               AND reserved_to = ?2 \
               AND reserved_until = ?4 \
             RETURNING *",
        )
        .bind(now)
        .bind(identity)
        .bind(serial)
        .bind(fencing_token)
        .fetch_optional(self.pool())
        .await?;

        if let Some(record) = claimed {
            debug!(serial, identity, "Key claimed");
            return Ok(ClaimResult::Claimed(record));
        }

        let Some(current) = self.get_key(serial).await? else {
            return Ok(ClaimResult::NotFound);
        };

        if current.claimed_at.is_some() && current.linked_to.as_deref() == Some(identity) {
            Ok(ClaimResult::AlreadyClaimed(current))
        } else {
            Ok(ClaimResult::LeaseLost(current))
        }
    }
}

/// Explain why the conditional reservation write matched nothing.
fn classify_conflict(current: &KeyRecord, identity: &str) -> ReservationResult {
    if current.claimed_at.is_some() || current.linked_to.is_some() {
        return ReservationResult::AlreadyClaimed {
            linked_to: current.linked_to.clone().unwrap_or_default(),
        };
    }

    let reserved_until = current.reserved_until.unwrap_or_default();
    if current.reserved_to.as_deref() == Some(identity) {
        ReservationResult::StillBeingClaimed { reserved_until }
    } else {
        ReservationResult::ReservedByOther { reserved_until }
    }
}
