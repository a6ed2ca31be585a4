use std::sync::{Mutex, OnceLock};

/// Global lock for environment variable modifications in tests.
/// Tests that touch the process environment (notably `STAGEHAND_STATE_DIR`
/// and `HOME`) must hold this lock so parallel tests cannot observe each
/// other's state directories.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
