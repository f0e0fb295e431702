//! Mutex lock recovery so one poisoned lock does not take down the sampler or bridge.

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::debug!(context, "mutex poisoned; recovering");
            poisoned.into_inner()
        }
    }
}
