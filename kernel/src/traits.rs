//! # Kernel Abstraction Traits
//!
//! The IPC core does not own a scheduler, a timer or page tables. It reaches
//! them through the traits here, which the embedding kernel implements and
//! hands to [`Kernel::new`](crate::Kernel::new).
//!
//! ## Testing Strategy
//!
//! [`mock`] provides a deterministic uniprocessor: every kernel thread runs
//! on its own host thread, but only the one the mock scheduler picked makes
//! progress. Tests drive real IPC between them.

use crate::ipc::{Fpage, Mword, MsgDope};
use crate::sched::{SpaceId, Thread};
use crate::time::IpcTimeout;
use alloc::sync::Arc;

#[cfg(test)]
pub mod mock;

/// How a direct switch treats helping (priority donation)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchMode {
    /// The caller donates its time to the target, which owns a lock the
    /// caller wants; the target switches back on release
    Helping,
    /// Leave existing helping relations alone; used when the owner hands the
    /// CPU back to its helper
    IgnoreHelping,
    /// Plain switch that ends any helping relation targeting the callee
    NotHelping,
}

/// Scheduler operations
///
/// All switches happen with the cpu lock released.
pub trait SchedulerOps: Send + Sync {
    /// Give up the CPU. Returns once `cur` is picked again; if `cur` is still
    /// ready that may be immediately.
    fn schedule(&self, cur: &Arc<Thread>);

    /// Switch directly to `target`. Falls back to [`schedule`] if `target`
    /// cannot run.
    ///
    /// [`schedule`]: Self::schedule
    fn switch_exec_locked(&self, cur: &Arc<Thread>, target: &Arc<Thread>, mode: SwitchMode);

    /// Put a ready thread on the ready queue (no-op if already queued)
    fn ready_enqueue(&self, thread: &Arc<Thread>);

    fn ready_dequeue(&self, thread: &Arc<Thread>);

    /// The thread that helped `owner` and should get the CPU back
    fn helper(&self, owner: &Arc<Thread>) -> Option<Arc<Thread>>;

    /// Whether `target` would preempt `cur` if made ready
    fn can_preempt_current(&self, cur: &Thread, target: &Thread) -> bool {
        target.prio() > cur.prio()
    }
}

/// Timer operations
pub trait TimerOps: Send + Sync {
    /// Current time in microseconds
    fn now(&self) -> u64;

    /// Call [`IpcTimeout::expire`] once its deadline has passed
    fn arm(&self, timeout: &Arc<IpcTimeout>);

    fn disarm(&self, timeout: &IpcTimeout);
}

/// A fault raised while the kernel touched user memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: Mword,
    pub write: bool,
}

/// Address-space operations
pub trait MappingOps: Send + Sync {
    /// Map `fpage` of `src` into `dst` within the receive window `window`.
    ///
    /// `offset` selects where inside a larger window the flexpage lands.
    /// Failures are reported in the returned dope
    /// ([`IpcError::RecvMapFailed`](crate::ipc::IpcError::RecvMapFailed)),
    /// success may carry
    /// [`DopeFlags::FPAGE_RECEIVED`](crate::ipc::DopeFlags::FPAGE_RECEIVED).
    fn fpage_map(&self, src: SpaceId, fpage: Fpage, dst: SpaceId, window: Fpage, offset: Mword) -> MsgDope;

    /// Read a word of user memory
    fn read_word(&self, space: SpaceId, addr: Mword) -> Result<Mword, PageFault>;

    /// Write a word of user memory
    fn write_word(&self, space: SpaceId, addr: Mword, val: Mword) -> Result<(), PageFault>;
}
