//! PostgreSQL persistence for lumen pipeline results.
//!
//! The core treats storage as an opaque upsert-by-key boundary; this crate
//! owns the connection config, pool, embedded migrations and the queries
//! behind that boundary.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
