//! # Nyx IPC Core
//!
//! Synchronous rendezvous IPC for the Nyx microkernel: short and long
//! messages, the register-only IPC shortcut, page faults turned into IPC to
//! a user-level pager, interrupts delivered as messages, and the
//! `Switch_lock` that serializes access to thread control blocks.
//!
//! ## Layout
//!
//! - [`ipc`]: message frames, timeouts, the send and receive halves, long
//!   transfers, the page-fault bridge and the shortcut
//! - [`sched`]: thread control blocks, the state word and `Switch_lock`
//! - [`driver::irq`]: interrupt objects that send like threads
//! - [`syscall`] and [`trap`]: the entry points the architecture layer calls
//! - [`traits`]: scheduler, timer and mapping services supplied by the
//!   embedding kernel
//!
//! The crate is `no_std` with `alloc`. Unit tests run on the host against
//! the mock uniprocessor in `traits::mock`.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod driver;
pub mod ipc;
pub mod kernel;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod time;
pub mod trace;
pub mod traits;
pub mod trap;

pub use config::IpcConfig;
pub use kernel::Kernel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
