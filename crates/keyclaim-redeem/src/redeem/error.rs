use thiserror::Error;

use crate::license::LicenseError;
use crate::ratelimit::format_wait;
use crate::storage::DatabaseError;

/// Why a redemption did not complete.
#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("this account may not redeem keys")]
    InvalidIdentity,

    #[error("serial not found")]
    NotFound,

    /// Claimed by a different identity.
    #[error("serial has already been redeemed")]
    AlreadyClaimed,

    #[error("serial is being redeemed by someone else, try again in a few seconds")]
    ReservedByOther { reserved_until: i64 },

    /// The caller's own earlier attempt still holds the lease.
    #[error("your redemption of this serial is still in progress, try again shortly")]
    StillBeingClaimed { reserved_until: i64 },

    /// The license was changed but the serial could not be claimed: the lease
    /// was lost or the claim write failed.
    #[error("license updated but serial {serial} could not be claimed, contact support")]
    ReservationRaceLost { serial: String },

    #[error("you already have a lifetime key")]
    AlreadyLifetime,

    #[error("serial record is invalid: {0}")]
    InvalidKeyRecord(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("you are being rate limited, try again in {}", format_wait(*retry_after))]
    RateLimited { reset_at: i64, retry_after: i64 },
}

impl RedeemError {
    /// Whether the same call may succeed if repeated later.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ReservedByOther { .. }
                | Self::StillBeingClaimed { .. }
                | Self::ExternalService(_)
                | Self::RateLimited { .. }
        )
    }
}

impl From<LicenseError> for RedeemError {
    fn from(e: LicenseError) -> Self {
        Self::ExternalService(e.to_string())
    }
}

impl From<DatabaseError> for RedeemError {
    fn from(e: DatabaseError) -> Self {
        Self::ExternalService(e.to_string())
    }
}
