// Synchronization primitives module

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, SpinLockStats};
