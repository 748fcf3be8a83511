//! Synchronization primitives
//!
//! The per-VM MMU lock is a reader/writer spinlock: translation faults and
//! range operations take it for write, the permission-relaxation fast path
//! takes it for read. Smaller pieces of state sit behind plain mutexes.

pub use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// MMU lock ownership held by the caller of a table operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared, only permission relaxation is allowed
    Shared,
    /// Exclusive
    Exclusive,
}

/// Drop a write guard and take the lock again
///
/// Lets long range operations bound the time they hold the MMU lock.
pub fn cond_resched_write<'a, T>(lock: &'a RwLock<T>, guard: RwLockWriteGuard<'a, T>) -> RwLockWriteGuard<'a, T> {
    drop(guard);
    ::core::hint::spin_loop();
    lock.write()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_resched_write() {
        let lock = RwLock::new(1u32);
        let mut guard = lock.write();
        *guard = 2;
        let guard = cond_resched_write(&lock, guard);
        assert_eq!(*guard, 2);
        drop(guard);
        assert_eq!(*lock.read(), 2);
    }
}
