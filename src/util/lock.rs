//! Poison-tolerant accessors for `std::sync` locks.
//!
//! Coordination state (the mock handler set, the rule store) is replaced
//! wholesale, so a guard left behind by a panicking writer still holds a
//! complete value and can be used as-is.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        report_poisoned(target, op, "rwlock.read");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        report_poisoned(target, op, "rwlock.write");
        poisoned.into_inner()
    })
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        report_poisoned(target, op, "mutex.lock");
        poisoned.into_inner()
    })
}

fn report_poisoned(target: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        target = "storyrender::util::lock",
        op,
        owner = target,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned coordination lock"
    );
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{AssertUnwindSafe, catch_unwind},
        sync::{Arc, Mutex, RwLock},
    };

    use super::*;

    #[test]
    fn poisoned_rwlock_still_yields_value() {
        let lock = Arc::new(RwLock::new(vec![1, 2]));
        let clone = Arc::clone(&lock);
        let _ = catch_unwind(AssertUnwindSafe(move || {
            let _guard = clone.write().expect("write");
            panic!("poison");
        }));

        assert!(lock.is_poisoned());
        assert_eq!(*rw_read(&lock, "test", "read"), vec![1, 2]);
        rw_write(&lock, "test", "write").push(3);
        assert_eq!(rw_read(&lock, "test", "read").len(), 3);
    }

    #[test]
    fn poisoned_mutex_still_yields_value() {
        let lock = Arc::new(Mutex::new(7));
        let clone = Arc::clone(&lock);
        let _ = catch_unwind(AssertUnwindSafe(move || {
            let _guard = clone.lock().expect("lock");
            panic!("poison");
        }));

        assert_eq!(*mutex_lock(&lock, "test", "lock"), 7);
    }
}
