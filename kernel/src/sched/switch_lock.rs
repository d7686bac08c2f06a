//! Priority-inheriting lock
//!
//! A [`SwitchLock`] never puts a contender to sleep on a queue of its own.
//! A thread that finds the lock taken switches to the owner instead
//! ("helping"), so the owner runs on the contender's time and priority until
//! it releases the lock. On release, the owner hands the CPU back to whoever
//! the scheduler says helped it.
//!
//! [`ThreadLock`] is the per-thread instance. Besides exclusion it carries a
//! switch hint: a partner that just made the locked thread ready can ask for
//! the CPU to go to that thread as soon as the lock is released.

use super::{Thread, ThreadId, ThreadState};
use crate::sync::CpuGuard;
use crate::traits::SwitchMode;
use crate::Kernel;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

/// Outcome of an acquisition attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockResult {
    /// The caller now owns the lock
    Acquired,
    /// The caller already owned the lock
    AlreadyOwned,
    /// Someone else owns the lock (non-blocking attempts only)
    Busy,
    /// The lock was invalidated; its object is being destroyed
    Invalid,
}

/// Lock whose contenders donate their CPU time to the owner
#[derive(Debug)]
pub struct SwitchLock {
    /// Raw id of the owning thread, 0 when free
    owner: AtomicU64,
    valid: AtomicBool,
}

impl Default for SwitchLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            valid: AtomicBool::new(true),
        }
    }

    /// Current owner, if locked
    pub fn lock_owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    /// Whether the lock is held by anyone
    #[inline]
    pub fn test(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn acquire(&self, cur: &Thread) -> LockResult {
        if !self.is_valid() {
            return LockResult::Invalid;
        }
        let me = cur.id().raw();
        match self
            .owner
            .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                cur.inc_lock_cnt();
                LockResult::Acquired
            }
            Err(owner) if owner == me => LockResult::AlreadyOwned,
            Err(_) => LockResult::Busy,
        }
    }

    /// Try once to take the lock; never switches
    pub fn try_lock(&self, k: &Kernel, cur: &Thread) -> LockResult {
        let _guard = k.cpu_lock.lock();
        self.acquire(cur)
    }

    /// Help the owner until the lock can be taken.
    ///
    /// Returns [`LockResult::Acquired`], [`LockResult::AlreadyOwned`] or
    /// [`LockResult::Invalid`]; never [`LockResult::Busy`].
    pub fn lock(&self, k: &Kernel, cur: &Arc<Thread>) -> LockResult {
        loop {
            let owner = {
                let _guard = k.cpu_lock.lock();
                match self.acquire(cur) {
                    LockResult::Busy => self.lock_owner(),
                    done => return done,
                }
            };
            self.help(k, cur, owner);
        }
    }

    /// [`lock`](Self::lock) for callers already inside the cpu lock.
    ///
    /// The critical section is left while helping the owner and entered
    /// again before retrying; the returned guard covers the acquisition.
    pub fn lock_dirty<'k>(
        &self,
        k: &'k Kernel,
        cur: &Arc<Thread>,
        guard: CpuGuard<'k>,
    ) -> (LockResult, CpuGuard<'k>) {
        let mut guard = guard;
        loop {
            match self.acquire(cur) {
                LockResult::Busy => {
                    let owner = self.lock_owner();
                    drop(guard);
                    self.help(k, cur, owner);
                    guard = k.cpu_lock.lock();
                }
                done => return (done, guard),
            }
        }
    }

    fn help(&self, k: &Kernel, cur: &Arc<Thread>, owner: Option<ThreadId>) {
        match owner.and_then(|id| k.lookup(id)) {
            Some(owner) => k.sched.switch_exec_locked(cur, &owner, SwitchMode::Helping),
            // owner released the lock in between, or is gone
            None => k.sched.schedule(cur),
        }
    }

    /// Lock unless the caller already owns the lock.
    ///
    /// `None` if the lock is invalid, `Some(true)` if the caller already
    /// owned it, `Some(false)` if it has just been acquired.
    pub fn test_and_set(&self, k: &Kernel, cur: &Arc<Thread>) -> Option<bool> {
        match self.lock(k, cur) {
            LockResult::AlreadyOwned => Some(true),
            LockResult::Acquired => Some(false),
            LockResult::Busy | LockResult::Invalid => None,
        }
    }

    /// Release the lock and give the CPU back to a helper
    pub fn clear(&self, k: &Kernel, cur: &Arc<Thread>) {
        {
            let _guard = k.cpu_lock.lock();
            self.release(cur);
        }
        self.switch_dirty(k, cur);
    }

    /// [`clear`](Self::clear) for callers already inside the cpu lock; the
    /// critical section ends with the release
    pub fn clear_dirty(&self, k: &Kernel, cur: &Arc<Thread>, guard: CpuGuard<'_>) {
        self.release(cur);
        drop(guard);
        self.switch_dirty(k, cur);
    }

    /// Release and invalidate; later acquisitions fail with `Invalid`
    pub fn clear_and_invalidate(&self, k: &Kernel, cur: &Arc<Thread>) {
        {
            let _guard = k.cpu_lock.lock();
            self.valid.store(false, Ordering::Release);
            self.release(cur);
        }
        self.switch_dirty(k, cur);
    }

    fn release(&self, cur: &Thread) {
        let me = cur.id().raw();
        assert_eq!(
            self.owner.load(Ordering::Acquire),
            me,
            "switch lock released by {:?}, which does not own it",
            cur.id()
        );
        self.owner.store(0, Ordering::Release);
        cur.dec_lock_cnt();
    }

    fn switch_dirty(&self, k: &Kernel, cur: &Arc<Thread>) {
        match k.sched.helper(cur) {
            Some(helper) if helper.id() != cur.id() => {
                k.sched
                    .switch_exec_locked(cur, &helper, SwitchMode::IgnoreHelping);
            }
            _ => {
                // a pending kill waits for our lock count to drop
                if cur.lock_cnt() == 0 && cur.donatee().is_some() {
                    k.sched.schedule(cur);
                }
            }
        }
    }
}

/// Scheduling hint evaluated when a [`ThreadLock`] is released
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchHint {
    None = 0,
    /// Switch to the locked thread if it is ready
    ActivateLockee = 1,
}

/// Per-thread lock serializing IPC partners and lifecycle operations
#[derive(Debug)]
pub struct ThreadLock {
    lock: SwitchLock,
    switch_hint: AtomicU8,
    lockee: Weak<Thread>,
}

impl ThreadLock {
    pub fn new(lockee: Weak<Thread>) -> Self {
        Self {
            lock: SwitchLock::new(),
            switch_hint: AtomicU8::new(SwitchHint::None as u8),
            lockee,
        }
    }

    pub fn lock(&self, k: &Kernel, cur: &Arc<Thread>) -> LockResult {
        self.lock.lock(k, cur)
    }

    pub fn try_lock(&self, k: &Kernel, cur: &Thread) -> LockResult {
        self.lock.try_lock(k, cur)
    }

    pub fn test(&self) -> bool {
        self.lock.test()
    }

    pub fn is_valid(&self) -> bool {
        self.lock.is_valid()
    }

    pub fn lock_owner(&self) -> Option<ThreadId> {
        self.lock.lock_owner()
    }

    pub fn set_switch_hint(&self, hint: SwitchHint) {
        self.switch_hint.store(hint as u8, Ordering::Release);
    }

    fn take_switch_hint(&self) -> SwitchHint {
        match self.switch_hint.swap(SwitchHint::None as u8, Ordering::AcqRel) {
            1 => SwitchHint::ActivateLockee,
            _ => SwitchHint::None,
        }
    }

    /// Release the lock, then run or enqueue the locked thread if it became
    /// ready while we held it
    pub fn clear(&self, k: &Kernel, cur: &Arc<Thread>) {
        let hint = self.take_switch_hint();
        self.lock.clear(k, cur);

        let Some(lockee) = self.lockee.upgrade() else {
            return;
        };
        if lockee.id() == cur.id() || !lockee.state().contains(ThreadState::READY) {
            return;
        }
        if hint == SwitchHint::ActivateLockee && k.config.switch_on_ipc {
            k.sched
                .switch_exec_locked(cur, &lockee, SwitchMode::NotHelping);
        } else {
            k.sched.ready_enqueue(&lockee);
        }
    }

    /// Release and invalidate the lock of a thread being killed
    pub fn clear_and_invalidate(&self, k: &Kernel, cur: &Arc<Thread>) {
        self.switch_hint
            .store(SwitchHint::None as u8, Ordering::Release);
        self.lock.clear_and_invalidate(k, cur);
    }
}
