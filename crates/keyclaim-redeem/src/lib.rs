//! keyclaim redemption library.
//!
//! Exactly-once redemption of pooled serials into license accounts:
//! - [`storage`]: the key pool with its lease/fencing-token claim protocol,
//!   rate-limit counters and the local license cache (`SQLite`)
//! - [`ratelimit`]: store-backed multi-bucket limiter with refunds
//! - [`license`]: the licensing authority boundary and its HTTP client
//! - [`notifications`]: redemption webhooks
//! - [`redeem`]: the redemption coordinator and serial parsing
//! - [`hwid`]: hardware-ID reset flow

pub mod hwid;
pub mod interval;
pub mod license;
pub mod notifications;
pub mod ratelimit;
pub mod redeem;
pub mod storage;
