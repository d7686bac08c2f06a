//! Thread state, locking and lifecycle
//!
//! The scheduler proper (ready queues, time slices, the dispatcher) lives
//! behind [`SchedulerOps`](crate::traits::SchedulerOps). This module holds
//! what the IPC core needs of a thread:
//!
//! - the atomic state word ([`state`])
//! - the priority-inheriting [`SwitchLock`] and per-thread [`ThreadLock`]
//! - the thread control block and registry ([`thread`])

mod state;
mod switch_lock;
mod thread;

pub use state::{IpcMode, StateWord, ThreadState};
pub use switch_lock::{LockResult, SwitchHint, SwitchLock, ThreadLock};
pub use thread::{ex_regs, halt, kill, ExRegs, ExRegsOld, SpaceId, Thread, ThreadId, ThreadTable};
pub(crate) use thread::PageinRequest;
