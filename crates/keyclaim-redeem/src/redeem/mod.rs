//! Key redemption.
//!
//! [`RedemptionCoordinator::redeem`] turns a serial into a license for one
//! identity. [`parse_serial`] extracts the serial from user input first.

mod coordinator;
mod error;
pub mod serial;


use serde::Serialize;

pub use coordinator::{LicensePlan, RedeemSettings, RedemptionCoordinator, plan_license};
pub use error::RedeemError;
pub use serial::{SerialError, parse_serial};

/// What happened to the identity's license account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseOperation {
    Created,
    Updated,
    /// A trial account was deleted and a new one created.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redemption {
    pub serial: String,
    pub user_key: String,
    pub operation: LicenseOperation,
    pub auth_expire: i64,
    /// Follow-up steps that failed after the claim.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RedemptionOutcome {
    Redeemed(Redemption),
    /// The serial was already claimed by the same identity.
    AlreadyRedeemed { serial: String },
}
