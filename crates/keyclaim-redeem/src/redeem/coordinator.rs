//! Redemption coordinator.
//!
//! Runs one redemption as a saga over the key store and the licensing
//! authority:
//!
//! 1. rate limit (`redeemkey`)
//! 2. take a lease on the serial (`try_reserve`)
//! 3. look up the identity's license account
//! 4. create, replace or extend it at the authority
//! 5. claim the serial with the lease's fencing token (`finalize_claim`)
//! 6. best-effort follow-ups: sync counter, local cache, notification
//!
//! The claim in step 5 is the durability boundary. Failures after it are
//! returned as warnings on a successful outcome. Failures before it leave
//! the lease to lapse on its own. A claim that cannot be written after the
//! authority was changed is reported as `ReservationRaceLost`, never as a
//! retryable error.

use std::collections::HashSet;
use std::sync::Arc;

use keyclaim_core::{Clock, Config};
use tracing::{error, info, instrument, warn};

use super::error::RedeemError;
use super::{LicenseOperation, Redemption, RedemptionOutcome};
use crate::interval::parse_interval;
use crate::license::{AccountUpdate, LIFETIME, LicenseAccount, LicenseAuthority};
use crate::notifications::{NotificationSink, RedemptionEvent};
use crate::ratelimit::{RateLimitService, SYSTEM_IDENTITY, buckets};
use crate::storage::{ClaimResult, KeyDatabase, KeyRecord, LicenseUser, ReservationResult};

/// Coordinator settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RedeemSettings {
    pub lease_secs: i64,
    pub checkpoint_prefix: String,
    pub blocked_identities: HashSet<String>,
}

impl RedeemSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease_secs: config.lease.seconds,
            checkpoint_prefix: config.license.checkpoint_note_prefix.clone(),
            blocked_identities: config.blocked_identities.iter().cloned().collect(),
        }
    }
}

impl Default for RedeemSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What to do at the authority for the claiming identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicensePlan {
    Create { auth_expire: i64 },
    /// Delete the trial account, then create a fresh one.
    Replace {
        checkpoint_key: String,
        auth_expire: i64,
    },
    Update {
        account: LicenseAccount,
        auth_expire: i64,
    },
}

/// Decide how a key of `duration` seconds (`None` = lifetime) applies to
/// the identity's current account.
///
/// Trial accounts are always replaced. Extensions start from the later of
/// the current expiry and `now`, so they never shorten an account.
pub fn plan_license(
    existing: Option<&LicenseAccount>,
    duration: Option<i64>,
    now: i64,
    checkpoint_prefix: &str,
) -> Result<LicensePlan, RedeemError> {
    let expiry_after = |base: i64| -> Result<i64, RedeemError> {
        duration.map_or(Ok(LIFETIME), |d| {
            base.checked_add(d).ok_or_else(|| {
                RedeemError::InvalidKeyRecord(format!("duration of {d}s overflows the expiry"))
            })
        })
    };
    let fresh_expiry = expiry_after(now)?;

    match existing {
        None => Ok(LicensePlan::Create {
            auth_expire: fresh_expiry,
        }),
        Some(account) if account.is_checkpoint(checkpoint_prefix) => Ok(LicensePlan::Replace {
            checkpoint_key: account.user_key.clone(),
            auth_expire: fresh_expiry,
        }),
        Some(account) if account.is_lifetime() => Err(RedeemError::AlreadyLifetime),
        Some(account) => Ok(LicensePlan::Update {
            account: account.clone(),
            auth_expire: expiry_after(account.auth_expire.max(now))?,
        }),
    }
}

pub struct RedemptionCoordinator<A, N> {
    db: KeyDatabase,
    limits: RateLimitService,
    authority: A,
    notifier: N,
    clock: Arc<dyn Clock>,
    settings: RedeemSettings,
}

impl<A: LicenseAuthority, N: NotificationSink> RedemptionCoordinator<A, N> {
    pub fn new(
        db: KeyDatabase,
        limits: RateLimitService,
        authority: A,
        notifier: N,
        clock: Arc<dyn Clock>,
        settings: RedeemSettings,
    ) -> Self {
        Self {
            db,
            limits,
            authority,
            notifier,
            clock,
            settings,
        }
    }

    pub const fn authority(&self) -> &A {
        &self.authority
    }

    pub const fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Redeem `serial` for `identity`.
    ///
    /// Safe to repeat: once the serial is claimed by `identity`, further
    /// calls return [`RedemptionOutcome::AlreadyRedeemed`] without touching
    /// the authority.
    #[instrument(skip_all, fields(serial = %serial, identity = %identity))]
    pub async fn redeem(
        &self,
        serial: &str,
        identity: &str,
    ) -> Result<RedemptionOutcome, RedeemError> {
        if identity.trim().is_empty() || self.settings.blocked_identities.contains(identity) {
            warn!("Redemption refused for identity");
            return Err(RedeemError::InvalidIdentity);
        }

        let decision = self
            .limits
            .limiter(buckets::REDEEM_KEY)
            .limit(identity)
            .await;
        if !decision.allowed {
            return Err(RedeemError::RateLimited {
                reset_at: decision.reset_at,
                retry_after: decision.retry_after(self.clock.now()),
            });
        }

        let result = self.reserve_and_claim(serial, identity).await;

        if let Err(RedeemError::ExternalService(cause)) = &result {
            warn!(error = %cause, "Redemption failed before claim, refunding attempt");
            if let Err(e) = self
                .limits
                .delete_request(buckets::REDEEM_KEY, identity)
                .await
            {
                warn!(error = %e, "Failed to refund redeem attempt");
            }
        }

        result
    }

    async fn reserve_and_claim(
        &self,
        serial: &str,
        identity: &str,
    ) -> Result<RedemptionOutcome, RedeemError> {
        let now = self.clock.now();

        let reservation = match self
            .db
            .try_reserve(serial, identity, now, self.settings.lease_secs)
            .await?
        {
            ReservationResult::Reserved(reservation) => reservation,
            ReservationResult::NotFound => return Err(RedeemError::NotFound),
            ReservationResult::AlreadyClaimed { linked_to } if linked_to == identity => {
                info!("Serial already redeemed by this identity");
                return Ok(RedemptionOutcome::AlreadyRedeemed {
                    serial: serial.to_string(),
                });
            }
            ReservationResult::AlreadyClaimed { .. } => return Err(RedeemError::AlreadyClaimed),
            ReservationResult::StillBeingClaimed { reserved_until } => {
                return Err(RedeemError::StillBeingClaimed { reserved_until });
            }
            ReservationResult::ReservedByOther { reserved_until } => {
                return Err(RedeemError::ReservedByOther { reserved_until });
            }
        };
        let record = &reservation.record;

        let duration = record
            .key_duration
            .as_deref()
            .map(parse_interval)
            .transpose()
            .map_err(|e| RedeemError::InvalidKeyRecord(format!("{serial}: {e}")))?;

        let existing = self.authority.find_by_identity(identity).await?;
        let plan = plan_license(
            existing.as_ref(),
            duration,
            now,
            &self.settings.checkpoint_prefix,
        )?;
        let had_checkpoint = matches!(plan, LicensePlan::Replace { .. });

        let note = format!("{} - {}", record.order_id, serial);
        let (account, operation) = self.apply_plan(plan, identity, &note).await?;

        let finalized = self
            .db
            .finalize_claim(serial, identity, reservation.fencing_token, self.clock.now())
            .await
            .map_err(|e| {
                error!(
                    user_key = %account.user_key,
                    auth_expire = account.auth_expire,
                    ?operation,
                    error = %e,
                    "License changed but the claim could not be written; needs manual reconciliation"
                );
                RedeemError::ReservationRaceLost {
                    serial: serial.to_string(),
                }
            })?;
        let claimed = match finalized {
            ClaimResult::Claimed(record) => record,
            ClaimResult::AlreadyClaimed(_) => {
                warn!(user_key = %account.user_key, "Serial was claimed by a concurrent attempt of the same identity");
                return Ok(RedemptionOutcome::AlreadyRedeemed {
                    serial: serial.to_string(),
                });
            }
            ClaimResult::NotFound | ClaimResult::LeaseLost(_) => {
                error!(
                    user_key = %account.user_key,
                    auth_expire = account.auth_expire,
                    ?operation,
                    "License changed but the lease was lost before the claim; needs manual reconciliation"
                );
                return Err(RedeemError::ReservationRaceLost {
                    serial: serial.to_string(),
                });
            }
        };

        info!(
            user_key = %account.user_key,
            auth_expire = account.auth_expire,
            ?operation,
            "Serial redeemed"
        );

        let warnings = self.after_claim(&claimed, &account, had_checkpoint).await;

        Ok(RedemptionOutcome::Redeemed(Redemption {
            serial: claimed.serial,
            user_key: account.user_key,
            operation,
            auth_expire: account.auth_expire,
            warnings,
        }))
    }

    async fn apply_plan(
        &self,
        plan: LicensePlan,
        identity: &str,
        note: &str,
    ) -> Result<(LicenseAccount, LicenseOperation), RedeemError> {
        match plan {
            LicensePlan::Create { auth_expire } => {
                let account = self
                    .authority
                    .create_account(identity, note, auth_expire)
                    .await?;
                Ok((account, LicenseOperation::Created))
            }
            LicensePlan::Replace {
                checkpoint_key,
                auth_expire,
            } => {
                self.authority.delete_account(&checkpoint_key).await?;
                info!(user_key = %checkpoint_key, "Trial account deleted");

                let account = self
                    .authority
                    .create_account(identity, note, auth_expire)
                    .await
                    .inspect_err(|e| {
                        error!(error = %e, "Trial account deleted but replacement was not created");
                    })?;
                Ok((account, LicenseOperation::Replaced))
            }
            LicensePlan::Update {
                mut account,
                auth_expire,
            } => {
                let update = AccountUpdate {
                    discord_id: Some(identity.to_string()),
                    note: Some(note.to_string()),
                    auth_expire: Some(auth_expire),
                };
                self.authority
                    .update_account(&account.user_key, &update)
                    .await?;

                account.auth_expire = auth_expire;
                account.note = note.to_string();
                Ok((account, LicenseOperation::Updated))
            }
        }
    }

    /// Follow-ups after the claim. Failures become warnings.
    async fn after_claim(
        &self,
        claimed: &KeyRecord,
        account: &LicenseAccount,
        had_checkpoint: bool,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        let identity = claimed.linked_to.clone().unwrap_or_default();
        let now = self.clock.now();

        if let Err(e) = self
            .limits
            .track_request(buckets::SYNC_USER, SYSTEM_IDENTITY)
            .await
        {
            warn!(error = %e, "Failed to count license sync");
            warnings.push(format!("license sync was not counted: {e}"));
        }

        let cached = LicenseUser {
            discord_id: identity.clone(),
            user_key: account.user_key.clone(),
            auth_expire: account.auth_expire,
            note: account.note.clone(),
            status: account.status.clone(),
            banned: account.banned,
            synced_at: now,
        };
        if let Err(e) = self.db.upsert_license_user(&cached).await {
            warn!(error = %e, "Failed to cache license account");
            warnings.push(format!("unable to synchronize local license cache: {e}"));
        }

        let event = RedemptionEvent {
            serial: claimed.serial.clone(),
            order_id: claimed.order_id.clone(),
            key_duration: claimed.key_duration.clone(),
            claimed_at: claimed.claimed_at.unwrap_or(now),
            identity,
            user_key: account.user_key.clone(),
            had_checkpoint,
            banned: account.banned,
            status: account.status.clone(),
        };
        if let Err(e) = self.notifier.notify(&event).await {
            warn!(error = %e, "Redemption notification failed");
            warnings.push(format!("notification was not delivered: {e}"));
        }

        warnings
    }
}
