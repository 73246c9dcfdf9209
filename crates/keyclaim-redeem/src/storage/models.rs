//! Data models for keyclaim storage.

use serde::{Deserialize, Serialize};

/// One purchasable serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct KeyRecord {
    pub serial: String,
    pub order_id: String,
    /// Interval string; `None` is a lifetime key.
    pub key_duration: Option<String>,
    pub claimed_at: Option<i64>,
    pub linked_to: Option<String>,
    pub reserved_to: Option<String>,
    /// Lease expiry in epoch seconds. Doubles as the fencing token.
    pub reserved_until: Option<i64>,
    pub created_at: i64,
}

/// Lifecycle state of a [`KeyRecord`] at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    Free,
    Reserved { by: String, until: i64 },
    Claimed { by: String, at: i64 },
}

impl KeyRecord {
    /// Derive the state at `now`. Stale reservation columns read as `Free`.
    ///
    /// A lease still holds in its final second (`now == reserved_until`),
    /// matching the reservation predicate.
    pub fn state_at(&self, now: i64) -> KeyState {
        if let Some(at) = self.claimed_at {
            return KeyState::Claimed {
                by: self.linked_to.clone().unwrap_or_default(),
                at,
            };
        }
        match (&self.reserved_to, self.reserved_until) {
            (Some(by), Some(until)) if now <= until => KeyState::Reserved {
                by: by.clone(),
                until,
            },
            _ => KeyState::Free,
        }
    }

    pub const fn is_lifetime(&self) -> bool {
        self.key_duration.is_none()
    }
}

/// Locally cached copy of a license account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LicenseUser {
    pub discord_id: String,
    pub user_key: String,
    /// Epoch seconds, `-1` for lifetime.
    pub auth_expire: i64,
    pub note: String,
    pub status: String,
    pub banned: i64,
    pub synced_at: i64,
}

/// Claimed / unclaimed totals for the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub total: i64,
    pub claimed: i64,
    pub reserved: i64,
}
