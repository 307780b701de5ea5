//! The plan store (§4.A): persists operations, plans, phases, and the
//! changelog behind a PostgreSQL-backed `sqlx` pool.
//!
//! `UpdatePhase`'s atomic compare-and-swap is `queries::phases::update_phase`;
//! `Save`/`Load` are `queries::plans::save_plan`/`load_plan`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use pool::{create_pool, ensure_database_exists, run_migrations};
