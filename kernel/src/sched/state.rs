//! Thread state word
//!
//! The state is a set of independent bits. Threads other than the owner
//! (a partner mid-handshake, a timeout, a canceling `ex_regs`) change it
//! concurrently, so every transition that depends on the previous value
//! goes through [`StateWord::change_safely`], a single compare-and-swap.
//!
//! An empty state word means the thread does not exist.

use crate::sync::CpuGuard;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Thread state bits
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ThreadState: u32 {
        /// Eligible to run
        const READY = 1 << 0;
        /// Abort in-flight IPC at the next check point
        const CANCEL = 1 << 1;
        /// Halted or killed
        const DEAD = 1 << 2;
        /// Waiting for the receiver to become ready (sending)
        const POLLING = 1 << 3;
        /// Waiting for a message
        const RECEIVING = 1 << 4;
        /// Set for the whole handshake
        const IPC_IN_PROGRESS = 1 << 5;
        /// Send phase not finished (handshake or long transfer)
        const SEND_IN_PROGRESS = 1 << 6;
        /// Receiver between its sender-queue check and going to sleep
        const BUSY = 1 << 7;
        /// Receiver has serviced a page-in and waits for the next one
        const BUSY_LONG = 1 << 8;
        /// Long message payload still being copied into this thread
        const RCVLONG_IN_PROGRESS = 1 << 9;
        /// A sender has locked this receiver and started the handshake
        const TRANSFER_IN_PROGRESS = 1 << 10;
        /// Exceptions and system calls are reported to the pager
        const ALIEN = 1 << 11;
        /// The pending system call of an alien has already been reported
        const DIS_ALIEN = 1 << 12;

        /// Any sending bit
        const SENDING_MASK = Self::POLLING.bits() | Self::SEND_IN_PROGRESS.bits();
        /// Any receiving bit
        const RECEIVING_MASK = Self::RECEIVING.bits() | Self::RCVLONG_IN_PROGRESS.bits();
        /// Every IPC mode bit
        const IPC_MASK = Self::SENDING_MASK.bits()
            | Self::RECEIVING_MASK.bits()
            | Self::IPC_IN_PROGRESS.bits();
    }
}

/// Mutually exclusive IPC mode derived from the state bits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcMode {
    /// Thread does not exist
    Invalid,
    /// Halted or killed
    Dead,
    /// Not involved in IPC
    Idle,
    /// Waiting for a receiver
    Polling,
    /// Handshake done, long payload still being sent
    Sending,
    /// Waiting for a message
    Receiving,
    /// Receiving a long payload
    LongReceiving,
}

impl ThreadState {
    /// The primary mode of a thread in this state
    pub fn mode(self) -> IpcMode {
        if self.is_empty() {
            IpcMode::Invalid
        } else if self.contains(Self::DEAD) {
            IpcMode::Dead
        } else if self.contains(Self::RCVLONG_IN_PROGRESS | Self::IPC_IN_PROGRESS) {
            IpcMode::LongReceiving
        } else if self.contains(Self::POLLING) {
            IpcMode::Polling
        } else if self.contains(Self::SEND_IN_PROGRESS) {
            IpcMode::Sending
        } else if self.contains(Self::RECEIVING | Self::IPC_IN_PROGRESS) {
            IpcMode::Receiving
        } else {
            IpcMode::Idle
        }
    }

    /// Whether the thread exists
    pub fn is_valid(self) -> bool {
        !self.is_empty()
    }
}

/// Atomic thread state word
#[derive(Debug, Default)]
pub struct StateWord(AtomicU32);

impl StateWord {
    pub const fn new(state: ThreadState) -> Self {
        Self(AtomicU32::new(state.bits()))
    }

    #[inline]
    pub fn get(&self) -> ThreadState {
        ThreadState::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the whole word
    #[inline]
    pub fn set(&self, state: ThreadState) {
        self.0.store(state.bits(), Ordering::Release);
    }

    /// Clear `del`, then set `add`, if the word still looks as expected.
    ///
    /// Succeeds only if every bit of `del` is set and no bit of `add` that is
    /// not also in `del` is set. Returns whether the change was made.
    pub fn change_safely(&self, del: ThreadState, add: ThreadState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let old = ThreadState::from_bits_retain(raw);
                if !old.contains(del) || old.intersects(add - del) {
                    None
                } else {
                    Some(((old - del) | add).bits())
                }
            })
            .is_ok()
    }

    /// Unconditionally clear `del` and set `add`; returns the old state
    pub fn change(&self, del: ThreadState, add: ThreadState) -> ThreadState {
        let old = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some(((ThreadState::from_bits_retain(raw) - del) | add).bits())
            })
            .unwrap_or_else(|raw| raw);
        ThreadState::from_bits_retain(old)
    }

    /// Set bits; returns the old state
    #[inline]
    pub fn add(&self, bits: ThreadState) -> ThreadState {
        ThreadState::from_bits_retain(self.0.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    /// Clear bits; returns the old state
    #[inline]
    pub fn del(&self, bits: ThreadState) -> ThreadState {
        ThreadState::from_bits_retain(self.0.fetch_and(!bits.bits(), Ordering::AcqRel))
    }

    /// [`change`](Self::change) under the cpu lock: a plain read-modify-write
    pub fn change_dirty(&self, _guard: &CpuGuard<'_>, del: ThreadState, add: ThreadState) -> ThreadState {
        let old = self.get();
        self.set((old - del) | add);
        old
    }

    /// [`add`](Self::add) under the cpu lock
    pub fn add_dirty(&self, guard: &CpuGuard<'_>, bits: ThreadState) -> ThreadState {
        self.change_dirty(guard, ThreadState::empty(), bits)
    }

    /// [`del`](Self::del) under the cpu lock
    pub fn del_dirty(&self, guard: &CpuGuard<'_>, bits: ThreadState) -> ThreadState {
        self.change_dirty(guard, bits, ThreadState::empty())
    }
}
