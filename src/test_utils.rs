use std::sync::{Mutex, MutexGuard, OnceLock};

/// Global lock for environment variable modifications in tests.
/// Tests that modify process-wide variables (HOME, PATH) acquire this lock so parallel
/// tests never observe each other's changes.
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
