//! Armed IPC timeouts
//!
//! An [`IpcTimeout`] is owned by the thread that sleeps on it. The timer
//! subsystem ([`TimerOps`]) keeps a reference while it is armed and calls
//! [`IpcTimeout::expire`] when the deadline passes. The IPC code never gets
//! a callback; it samples [`IpcTimeout::has_hit`] in its wait loops.

use crate::sched::{Thread, ThreadState};
use crate::traits::TimerOps;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A one-shot timeout waking its owner out of an IPC wait
#[derive(Debug)]
pub struct IpcTimeout {
    deadline: AtomicU64,
    armed: AtomicBool,
    hit: AtomicBool,
    owner: Weak<Thread>,
}

impl IpcTimeout {
    /// Unarmed timeout belonging to `owner`
    pub fn new(owner: Weak<Thread>) -> Arc<Self> {
        Arc::new(Self {
            deadline: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            hit: AtomicBool::new(false),
            owner,
        })
    }

    /// Arm for the absolute time `deadline` (microseconds)
    pub fn set(self: &Arc<Self>, timer: &dyn TimerOps, deadline: u64) {
        self.deadline.store(deadline, Ordering::Relaxed);
        self.hit.store(false, Ordering::Relaxed);
        if !self.armed.swap(true, Ordering::AcqRel) {
            timer.arm(self);
        }
    }

    /// Disarm. A timeout that already fired keeps its `has_hit` mark.
    pub fn reset(&self, timer: &dyn TimerOps) {
        if self.armed.swap(false, Ordering::AcqRel) {
            timer.disarm(self);
        }
    }

    /// Re-arm with the previous deadline after a [`reset`](Self::reset),
    /// unless the timeout fired in between
    pub fn set_again(self: &Arc<Self>, timer: &dyn TimerOps) {
        if self.has_hit() {
            return;
        }
        if !self.armed.swap(true, Ordering::AcqRel) {
            timer.arm(self);
        }
    }

    pub fn is_set(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn has_hit(&self) -> bool {
        self.hit.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Relaxed)
    }

    /// Thread sleeping on this timeout
    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.owner.upgrade()
    }

    /// Fire the timeout.
    ///
    /// Called by the timer subsystem. Takes the owner out of its IPC wait
    /// and returns it so the caller can put it on the ready queue.
    pub fn expire(&self) -> Option<Arc<Thread>> {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.hit.store(true, Ordering::Release);

        let owner = self.owner.upgrade()?;
        owner.state_change(ThreadState::IPC_IN_PROGRESS, ThreadState::READY);
        log::trace!("IPC timeout of {:?} expired", owner.id());
        Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ThreadId;
    use crate::traits::mock::Harness;

    #[test]
    fn test_expire_wakes_owner() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        t.state_change(ThreadState::READY, ThreadState::RECEIVING | ThreadState::IPC_IN_PROGRESS);

        let to = IpcTimeout::new(Arc::downgrade(&t));
        to.set(&*h.kernel.timer, 100);
        assert!(to.is_set());

        let owner = to.expire().unwrap();
        assert_eq!(owner.id(), ThreadId::new(1, 0));
        assert!(to.has_hit());
        assert!(!to.is_set());
        assert!(t.state().contains(ThreadState::READY));
        assert!(!t.state().contains(ThreadState::IPC_IN_PROGRESS));

        // a second expiry is a no-op
        assert!(to.expire().is_none());
    }

    #[test]
    fn test_reset_and_set_again() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        let to = IpcTimeout::new(Arc::downgrade(&t));

        to.set(&*h.kernel.timer, 50);
        to.reset(&*h.kernel.timer);
        assert!(!to.is_set());
        assert!(!to.has_hit());

        to.set_again(&*h.kernel.timer);
        assert!(to.is_set());
        assert_eq!(to.deadline(), 50);

        to.expire();
        to.set_again(&*h.kernel.timer);
        assert!(!to.is_set());
    }
}
