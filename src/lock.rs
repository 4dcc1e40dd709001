//! Poison-tolerant mutex access for the transport halves and the log file.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Take the lock even when an earlier holder panicked.
pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recovered(poisoned, context))
}

pub(crate) fn into_inner_or_recover<T>(lock: Mutex<T>, context: &str) -> T {
    lock.into_inner()
        .unwrap_or_else(|poisoned| recovered(poisoned, context))
}

fn recovered<G>(poisoned: PoisonError<G>, context: &str) -> G {
    tracing::warn!(context, "mutex poisoned; recovering");
    poisoned.into_inner()
}
