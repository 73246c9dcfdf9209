//! `SQLite` database handle for the key pool.

pub use keyclaim_core::db::DatabaseError;

keyclaim_core::define_database!(KeyDatabase, "Key database migrations complete");
