//! Synchronization primitives
//!
//! This module provides the spinlocks used for cross-core coordination in
//! the trap path. There is no scheduler to sleep on; every waiter spins.

pub mod spinlock;

// Re-export for convenience
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
