//! Licensing authority boundary.
//!
//! The authority owns license accounts (one per identity) and offers plain
//! request/response calls with no transactions. [`LicenseAuthority`] is the
//! seam the redemption and HWID reset flows are written against;
//! [`LuarmorClient`] implements it over HTTP.

pub mod client;


use std::future::Future;

use serde::{Deserialize, Serialize};

pub use client::LuarmorClient;

/// `auth_expire` value of a lifetime account.
pub const LIFETIME: i64 = -1;

/// An account as reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseAccount {
    pub user_key: String,
    #[serde(default)]
    pub discord_id: String,
    /// Epoch seconds, or [`LIFETIME`].
    pub auth_expire: i64,
    #[serde(default)]
    pub note: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub banned: i64,
}

fn default_status() -> String {
    "reset".to_string()
}

impl LicenseAccount {
    pub const fn is_lifetime(&self) -> bool {
        self.auth_expire == LIFETIME
    }

    /// Trial accounts are recognised by their note prefix.
    pub fn is_checkpoint(&self, note_prefix: &str) -> bool {
        !note_prefix.is_empty() && self.note.starts_with(note_prefix)
    }
}

/// Fields to change on an existing account. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_expire: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    /// The HTTP request itself failed (connect, timeout, TLS).
    #[error("license API request failed: {0}")]
    Request(String),

    /// The authority answered with a non-success status code.
    #[error("license API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The authority answered 2xx but reported `success: false`.
    #[error("license API rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected license API response: {0}")]
    Decode(String),

    #[error("license client configuration error: {0}")]
    Config(String),
}

impl LicenseError {
    /// Whether repeating the same call later may succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Rejected(_) | Self::Decode(_) | Self::Config(_) => false,
        }
    }
}

/// Operations the core needs from the licensing authority.
pub trait LicenseAuthority: Send + Sync {
    /// The account bound to an identity, if any. At most one exists.
    fn find_by_identity(
        &self,
        identity: &str,
    ) -> impl Future<Output = Result<Option<LicenseAccount>, LicenseError>> + Send;

    fn find_by_key(
        &self,
        user_key: &str,
    ) -> impl Future<Output = Result<Option<LicenseAccount>, LicenseError>> + Send;

    fn create_account(
        &self,
        identity: &str,
        note: &str,
        auth_expire: i64,
    ) -> impl Future<Output = Result<LicenseAccount, LicenseError>> + Send;

    fn update_account(
        &self,
        user_key: &str,
        update: &AccountUpdate,
    ) -> impl Future<Output = Result<(), LicenseError>> + Send;

    fn delete_account(&self, user_key: &str)
    -> impl Future<Output = Result<(), LicenseError>> + Send;

    /// Clear the hardware binding of an account. `force` skips the
    /// authority's own cooldown. Returns the authority's message.
    fn reset_hwid(
        &self,
        user_key: &str,
        force: bool,
    ) -> impl Future<Output = Result<String, LicenseError>> + Send;
}
