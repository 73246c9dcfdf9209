//! `keyclaim` Core Library
//!
//! Shared functionality for `keyclaim` components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Wall clock abstraction used by the lease and rate-limit logic
//! - Tracing initialisation
//! - Common error types

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
