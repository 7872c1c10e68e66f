//! Lock acquisition that survives a panicking holder.
//!
//! Guarded state in this crate is valid after any partial update, so a poisoned
//! lock is logged, its flag cleared, and its guard handed back.

use std::sync::{
    LockResult, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tracing::warn;

fn recover<G>(
    result: LockResult<G>,
    owner: &'static str,
    op: &'static str,
    kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned: PoisonError<G>| {
        warn!(
            owner,
            op,
            kind,
            "lock poisoned by an earlier panic; continuing with its state"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), owner, op, "read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    let guard = recover(lock.write(), owner, op, "write");
    lock.clear_poison();
    guard
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    let guard = recover(lock.lock(), owner, op, "mutex");
    lock.clear_poison();
    guard
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn mutex_lock_recovers_after_panic() {
        let lock = Mutex::new(vec![1_u32]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison the lock");
        }));
        assert!(lock.is_poisoned());

        mutex_lock(&lock, "sync::tests", "push").push(2);
        assert_eq!(*mutex_lock(&lock, "sync::tests", "read"), vec![1, 2]);
        assert!(!lock.is_poisoned());
    }

    #[test]
    fn rwlock_helpers_recover_after_panic() {
        let lock = RwLock::new(0_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquired");
            panic!("poison the lock");
        }));

        *rw_write(&lock, "sync::tests", "write") = 7;
        assert_eq!(*rw_read(&lock, "sync::tests", "read"), 7);
        assert!(!lock.is_poisoned());
    }
}
