//! Hardware-ID reset.
//!
//! Two buckets guard a reset. `hwidreset_success` is checked first and only
//! counted once the authority has reset the binding. `hwidreset_request` is
//! counted for every attempt that passes the first check, so failed tries
//! are throttled too. A transient authority failure refunds the request
//! counter. Admins skip both buckets and the ownership check, and force the
//! reset at the authority.

use std::collections::HashSet;
use std::sync::Arc;

use keyclaim_core::Clock;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::license::{LicenseAccount, LicenseAuthority, LicenseError};
use crate::ratelimit::{LimitDecision, RateLimitService, buckets, format_wait};
use crate::storage::{KeyDatabase, LicenseUser};

#[derive(Debug, Error)]
pub enum HwidResetError {
    #[error("HWID reset is on cooldown, try again in {}", format_wait(*retry_after))]
    RateLimited {
        bucket: &'static str,
        reset_at: i64,
        retry_after: i64,
    },

    #[error("no license account with this key")]
    AccountNotFound,

    #[error("this license key belongs to another account")]
    NotOwner,

    #[error("external service error: {0}")]
    ExternalService(String),
}

impl From<LicenseError> for HwidResetError {
    fn from(e: LicenseError) -> Self {
        Self::ExternalService(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwidResetOutcome {
    pub user_key: String,
    /// Message returned by the authority.
    pub message: String,
    pub warnings: Vec<String>,
}

pub struct HwidResetFlow<A> {
    db: KeyDatabase,
    limits: RateLimitService,
    authority: A,
    clock: Arc<dyn Clock>,
    admins: HashSet<String>,
}

impl<A: LicenseAuthority> HwidResetFlow<A> {
    pub fn new(
        db: KeyDatabase,
        limits: RateLimitService,
        authority: A,
        clock: Arc<dyn Clock>,
        admins: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            db,
            limits,
            authority,
            clock,
            admins: admins.into_iter().collect(),
        }
    }

    pub const fn authority(&self) -> &A {
        &self.authority
    }

    #[instrument(skip_all, fields(user_key = %user_key, identity = %identity))]
    pub async fn reset_hwid(
        &self,
        user_key: &str,
        identity: &str,
    ) -> Result<HwidResetOutcome, HwidResetError> {
        let admin = self.admins.contains(identity);

        if !admin {
            let success = self
                .limits
                .limiter(buckets::HWID_RESET_SUCCESS)
                .check(identity)
                .await;
            self.ensure_allowed(buckets::HWID_RESET_SUCCESS, success)?;

            let request = self
                .limits
                .limiter(buckets::HWID_RESET_REQUEST)
                .limit(identity)
                .await;
            self.ensure_allowed(buckets::HWID_RESET_REQUEST, request)?;
        }

        let result = self.reset_owned(user_key, identity, admin).await;

        if let Err(HwidResetError::ExternalService(cause)) = &result {
            if !admin {
                warn!(error = %cause, "HWID reset failed, refunding attempt");
                if let Err(e) = self
                    .limits
                    .delete_request(buckets::HWID_RESET_REQUEST, identity)
                    .await
                {
                    warn!(error = %e, "Failed to refund HWID reset attempt");
                }
            }
        }

        result
    }

    fn ensure_allowed(
        &self,
        bucket: &'static str,
        decision: LimitDecision,
    ) -> Result<(), HwidResetError> {
        if decision.allowed {
            Ok(())
        } else {
            Err(HwidResetError::RateLimited {
                bucket,
                reset_at: decision.reset_at,
                retry_after: decision.retry_after(self.clock.now()),
            })
        }
    }

    async fn reset_owned(
        &self,
        user_key: &str,
        identity: &str,
        admin: bool,
    ) -> Result<HwidResetOutcome, HwidResetError> {
        let account = self
            .authority
            .find_by_key(user_key)
            .await?
            .ok_or(HwidResetError::AccountNotFound)?;
        if !admin && account.discord_id != identity {
            return Err(HwidResetError::NotOwner);
        }

        let message = self.authority.reset_hwid(user_key, admin).await?;
        info!(admin, "HWID reset");

        let mut warnings = Vec::new();
        if !admin {
            if let Err(e) = self
                .limits
                .track_request(buckets::HWID_RESET_SUCCESS, identity)
                .await
            {
                warn!(error = %e, "Failed to count successful HWID reset");
                warnings.push(format!("reset cooldown was not recorded: {e}"));
            }
        }

        if let Err(e) = self.resync(user_key, &account.discord_id).await {
            warn!(error = %e, "License cache resync failed after HWID reset");
            warnings.push(format!("unable to synchronize local license cache: {e}"));
        }

        Ok(HwidResetOutcome {
            user_key: user_key.to_string(),
            message,
            warnings,
        })
    }

    /// Refresh the cached account by key, falling back to the owner identity.
    async fn resync(&self, user_key: &str, owner: &str) -> Result<(), String> {
        let by_key = match self.authority.find_by_key(user_key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Lookup by key failed, trying by identity");
                None
            }
        };
        let account = match by_key {
            Some(account) => account,
            None => self
                .authority
                .find_by_identity(owner)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "account no longer exists".to_string())?,
        };
        self.cache(&account).await.map_err(|e| e.to_string())
    }

    async fn cache(&self, account: &LicenseAccount) -> Result<(), crate::storage::DatabaseError> {
        self.db
            .upsert_license_user(&LicenseUser {
                discord_id: account.discord_id.clone(),
                user_key: account.user_key.clone(),
                auth_expire: account.auth_expire,
                note: account.note.clone(),
                status: account.status.clone(),
                banned: account.banned,
                synced_at: self.clock.now(),
            })
            .await
    }
}
