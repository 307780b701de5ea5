//! Test-only helpers shared across this crate's unit tests.

use std::sync::{Mutex, OnceLock};

/// Serializes tests that mutate process environment variables
/// (`KEEL_DATABASE_URL`, `KEEL_TOKEN_SECRET`, `HOME`, `XDG_CONFIG_HOME`),
/// since `std::env::set_var`/`remove_var` affect the whole process and
/// `cargo test` runs unit tests on multiple threads by default.
pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
