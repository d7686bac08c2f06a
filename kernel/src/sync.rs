//! # Kernel Locking Primitives
//!
//! Two kinds of exclusion exist in the IPC core:
//!
//! - The **cpu lock**: the global interrupt-disable critical section. On a
//!   uniprocessor nothing else runs while it is held, so "dirty" state
//!   updates are safe under it. Functions that rely on it take a
//!   [`CpuGuard`] by reference; the borrow checker makes sure the guard is
//!   alive for the whole call.
//! - **Ordered table locks** around the thread and interrupt registries.
//!   Locks must be acquired in increasing [`LockLevel`] order and are never
//!   held across a context switch.
//!
//! Per-thread IPC fields sit behind `spin::Mutex`es at the `Object` level.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock ordering levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Level 0: thread and interrupt registries
    Table = 0,
    /// Level 1: individual object state (thread IPC fields, frames)
    Object = 1,
}

/// Global interrupt-disable lock.
///
/// Acquiring is a flag swap rather than a spin: the real primitive is `cli`,
/// and a context switch while it is held hands the critical section to the
/// next context instead of deadlocking.
#[derive(Debug, Default)]
pub struct CpuLock {
    held: AtomicBool,
}

impl CpuLock {
    /// Create a released cpu lock
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Enter the critical section.
    ///
    /// Nesting is allowed; only the outermost guard re-enables.
    #[inline]
    pub fn lock(&self) -> CpuGuard<'_> {
        let was_held = self.held.swap(true, Ordering::AcqRel);
        CpuGuard {
            lock: self,
            was_held,
        }
    }

    /// Whether the critical section is currently entered
    #[inline]
    pub fn test(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Proof that the cpu lock is held.
///
/// Restores the previous state when dropped.
#[must_use = "dropping the guard leaves the critical section"]
pub struct CpuGuard<'a> {
    lock: &'a CpuLock,
    was_held: bool,
}

impl CpuGuard<'_> {
    /// Whether this guard is the outermost one
    pub fn is_outermost(&self) -> bool {
        !self.was_held
    }
}

impl Drop for CpuGuard<'_> {
    fn drop(&mut self) {
        if !self.was_held {
            self.lock.held.store(false, Ordering::Release);
        }
    }
}

/// A read-write lock with an associated ordering level.
pub struct OrderedRwLock<T, const LEVEL: u8> {
    inner: RwLock<T>,
    #[cfg(debug_assertions)]
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedRwLock<T, LEVEL> {
    /// Create a new ordered lock.
    pub const fn new(value: T, _name: &'static str) -> Self {
        Self {
            inner: RwLock::new(value),
            #[cfg(debug_assertions)]
            name: _name,
        }
    }

    /// Acquire a read lock.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Acquire a write lock.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    /// Get the lock level.
    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    /// Get the lock name (debug builds only).
    #[cfg(debug_assertions)]
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Level 0 lock - for the thread and interrupt tables
pub type TableLock<T> = OrderedRwLock<T, { LockLevel::Table as u8 }>;
