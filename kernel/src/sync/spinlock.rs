// Spinlock implementation for kernel synchronization

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

/// Owner id recorded while the lock is held. The core targets a single
/// logical CPU; on future SMP this becomes the CPU number.
const OWNER_BOOT_CPU: u32 = 1;
const OWNER_NONE: u32 = 0;

/// Diagnostic counters for a spinlock.
#[derive(Debug, Clone, Copy)]
pub struct SpinLockStats {
    /// Total successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to spin at least once.
    pub contended: u64,
}

/// A test-and-set spinlock with owner tracking.
pub struct SpinLock<T> {
    locked: AtomicBool,
    owner: AtomicU32,
    acquisitions: AtomicU64,
    contended: AtomicU64,
    data: UnsafeCell<T>,
}

// SAFETY: SpinLock can be safely shared between threads
// because it uses atomic operations for synchronization
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(data: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(OWNER_NONE),
            acquisitions: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it's available
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut spun = false;
        // Spin until we can set locked from false to true
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spun = true;
            // Hint to CPU that we're spinning
            core::hint::spin_loop();
        }

        self.owner.store(OWNER_BOOT_CPU, Ordering::Relaxed);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if spun {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }

        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` if it's
    /// already held. Used from interrupt context where spinning on a lock
    /// held by the interrupted code would deadlock.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(OWNER_BOOT_CPU, Ordering::Relaxed);
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Snapshot the diagnostic counters.
    pub fn stats(&self) -> SpinLockStats {
        SpinLockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard for SpinLock
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so exclusive access is guaranteed
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so exclusive access is guaranteed
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Diagnostic only: a release by a non-owner indicates a guard that
        // escaped its critical section.
        let owner = self.lock.owner.swap(OWNER_NONE, Ordering::Relaxed);
        if owner == OWNER_NONE {
            log::warn!("SpinLock released with no recorded owner");
        }
        // Release the lock
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock_contention() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_stats_count_acquisitions() {
        let lock = SpinLock::new(0u8);
        for _ in 0..3 {
            let _ = lock.lock();
        }
        assert_eq!(lock.stats().acquisitions, 3);
        assert_eq!(lock.stats().contended, 0);
    }
}
