//! `SQLite` storage for the key pool.
//!
//! Provides persistence for serial keys and their lease/claim state, the
//! shared rate-limit counters, and the local license account mirror.

mod db;
mod models;
mod queries_keys;
mod queries_license;
mod queries_limits;

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests;

pub use db::{DatabaseError, KeyDatabase};
pub use models::*;
pub use queries_keys::{ClaimResult, NewKey, Reservation, ReservationResult};
pub use queries_limits::CounterState;
