//! # Synchronous IPC
//!
//! Rendezvous-style message passing between two threads, in the L4 v2
//! manner: a sender and a receiver meet, the sender's registers are copied
//! into the receiver's frame and both continue.
//!
//! ## Paths
//!
//! - **Shortcut** ([`ipc_short_cut`]): register-only send with an optional
//!   zero or infinite receive, to a destination that is already waiting.
//! - **General path** ([`prepare_receive`], [`do_send`], [`do_receive`]):
//!   every other case, including waits with finite timeouts, open waits with
//!   queued senders and long messages.
//! - **Long transfer** ([`do_send_long`]): payload copy after the handshake, driven
//!   by page-in requests the receiver services through its pager.
//! - **Page-fault bridge** ([`handle_page_fault_pager`]): a page fault
//!   turned into a call to the faulting thread's pager.
//!
//! Failures are [`IpcError`]s inside the core. They become a [`MsgDope`]
//! only at the system-call boundary.

mod long;
mod message;
mod pagefault;
mod receiver;
mod rendezvous;
mod sender;
mod shortcut;
mod timeout;

pub use long::{do_send_long, ipc_continue};
pub use message::{
    shared_frame, Fpage, IpcFrame, Mword, RcvDesc, SharedFrame, SndDesc, NUM_REG_WORDS,
    PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, WORD_SIZE,
};
pub use pagefault::{handle_page_fault_pager, page_fault_msg, PfErr};
pub use receiver::{arm_receive, do_receive, prepare_receive, TryLock};
pub use rendezvous::{ipc_send_regs, wake_receiver};
pub use sender::{do_send, sender_dequeue, sender_enqueue, Sender};
pub use shortcut::{ipc_short_cut, DeclineReason};
pub use timeout::{Timeout, WaitSpec, PF_ZERO};

use crate::sched::ThreadId;
use alloc::sync::Arc;
use core::fmt;

/// IPC error codes as carried in the message dope.
///
/// Bit 4 of the code marks errors reported to the sending side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum IpcError {
    #[error("partner does not exist")]
    NotExistent,
    #[error("receive timeout")]
    RecvTimeout,
    #[error("send timeout")]
    SendTimeout,
    #[error("receive canceled")]
    RecvCanceled,
    #[error("send canceled")]
    SendCanceled,
    #[error("receive-side mapping failed")]
    RecvMapFailed,
    #[error("send-side mapping failed")]
    SendMapFailed,
    #[error("receive aborted: send page-fault timeout")]
    RecvSendPfTimeout,
    #[error("send aborted: send page-fault timeout")]
    SendSendPfTimeout,
    #[error("receive aborted: receive page-fault timeout")]
    RecvRecvPfTimeout,
    #[error("send aborted: receive page-fault timeout")]
    SendRecvPfTimeout,
    #[error("receive aborted")]
    RecvAborted,
    #[error("send aborted")]
    SendAborted,
    #[error("receive buffer too small, message cut")]
    RecvMsgCut,
    #[error("message cut at the receiver")]
    SendMsgCut,
}

impl IpcError {
    /// Dope error code
    pub const fn code(self) -> Mword {
        match self {
            IpcError::NotExistent => 0x10,
            IpcError::RecvTimeout => 0x20,
            IpcError::SendTimeout => 0x30,
            IpcError::RecvCanceled => 0x40,
            IpcError::SendCanceled => 0x50,
            IpcError::RecvMapFailed => 0x60,
            IpcError::SendMapFailed => 0x70,
            IpcError::RecvSendPfTimeout => 0x80,
            IpcError::SendSendPfTimeout => 0x90,
            IpcError::RecvRecvPfTimeout => 0xA0,
            IpcError::SendRecvPfTimeout => 0xB0,
            IpcError::RecvAborted => 0xC0,
            IpcError::SendAborted => 0xD0,
            IpcError::RecvMsgCut => 0xE0,
            IpcError::SendMsgCut => 0xF0,
        }
    }

    /// Decode a dope error code; 0 and unknown codes yield `None`
    pub const fn from_code(code: Mword) -> Option<Self> {
        Some(match code & MsgDope::ERROR_MASK {
            0x10 => IpcError::NotExistent,
            0x20 => IpcError::RecvTimeout,
            0x30 => IpcError::SendTimeout,
            0x40 => IpcError::RecvCanceled,
            0x50 => IpcError::SendCanceled,
            0x60 => IpcError::RecvMapFailed,
            0x70 => IpcError::SendMapFailed,
            0x80 => IpcError::RecvSendPfTimeout,
            0x90 => IpcError::SendSendPfTimeout,
            0xA0 => IpcError::RecvRecvPfTimeout,
            0xB0 => IpcError::SendRecvPfTimeout,
            0xC0 => IpcError::RecvAborted,
            0xD0 => IpcError::SendAborted,
            0xE0 => IpcError::RecvMsgCut,
            0xF0 => IpcError::SendMsgCut,
            _ => return None,
        })
    }

    /// Whether the error is reported to the sending side
    pub const fn is_send_error(self) -> bool {
        self.code() & MsgDope::SEND_ERROR != 0
    }

    /// Same error as seen by the sender
    pub const fn to_send_side(self) -> Self {
        match Self::from_code(self.code() | MsgDope::SEND_ERROR) {
            Some(e) => e,
            None => self,
        }
    }

    /// Same error as seen by the receiver; `NotExistent` has no receive twin
    pub const fn to_recv_side(self) -> Self {
        match self {
            IpcError::NotExistent => IpcError::RecvAborted,
            _ => match Self::from_code(self.code() & !MsgDope::SEND_ERROR) {
                Some(e) => e,
                None => self,
            },
        }
    }
}

bitflags::bitflags! {
    /// Informational bits of a message dope
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DopeFlags: Mword {
        /// The message was sent with the deceit bit
        const DECEITED = 1 << 0;
        /// A flexpage was mapped into the receiver
        const FPAGE_RECEIVED = 1 << 1;
        /// The message was redirected
        const REDIRECTED = 1 << 2;
        /// The sender lives inside the receiver's clan
        const SRC_INSIDE = 1 << 3;
    }
}

/// Message dope: status and size of a finished IPC.
///
/// ```text
/// 31          13 12     8 7     4 3     0
/// +-------------+--------+-------+-------+
/// |   mwords    | strings| error | flags |
/// +-------------+--------+-------+-------+
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgDope(pub Mword);

impl MsgDope {
    /// Error field
    pub const ERROR_MASK: Mword = 0xf0;
    /// Error bit marking send-side errors
    pub const SEND_ERROR: Mword = 0x10;

    const FLAGS_MASK: Mword = 0x0f;
    const STRINGS_SHIFT: u32 = 8;
    const STRINGS_MASK: Mword = 0x1f;
    const MWORDS_SHIFT: u32 = 13;
    const MWORDS_MASK: Mword = 0x7ffff;

    /// Successful dope for `mwords` words and `strings` strings
    pub const fn new(mwords: usize, strings: usize) -> Self {
        Self(
            ((mwords & Self::MWORDS_MASK) << Self::MWORDS_SHIFT)
                | ((strings & Self::STRINGS_MASK) << Self::STRINGS_SHIFT),
        )
    }

    /// Dope carrying only an error
    pub const fn from_error(err: IpcError) -> Self {
        Self(err.code())
    }

    pub const fn raw(self) -> Mword {
        self.0
    }

    pub const fn mwords(self) -> usize {
        (self.0 >> Self::MWORDS_SHIFT) & Self::MWORDS_MASK
    }

    pub const fn strings(self) -> usize {
        (self.0 >> Self::STRINGS_SHIFT) & Self::STRINGS_MASK
    }

    pub fn flags(self) -> DopeFlags {
        DopeFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    pub fn with_flags(self, flags: DopeFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    pub const fn has_error(self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    pub const fn error(self) -> Option<IpcError> {
        IpcError::from_code(self.0)
    }

    /// Replace the error field, keeping size and flags
    pub fn set_error(&mut self, err: IpcError) {
        self.0 = (self.0 & !Self::ERROR_MASK) | err.code();
    }

    /// Merge a dope produced by another subsystem (the mapper).
    ///
    /// Keeps our own non-error bits and ORs the other dope in.
    pub fn combine(&mut self, other: MsgDope) {
        self.0 = (self.0 & !Self::ERROR_MASK) | other.0;
    }

    /// The dope as a result
    pub fn result(self) -> Result<(), IpcError> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether the mapper reported a failed receive mapping
    pub fn rcv_map_failed(self) -> bool {
        self.error() == Some(IpcError::RecvMapFailed)
    }
}

impl fmt::Debug for MsgDope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgDope")
            .field("mwords", &self.mwords())
            .field("strings", &self.strings())
            .field("error", &self.error())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Result of one rendezvous attempt.
///
/// `Retry` means the receiver was not ready; the sender must wait and try
/// again. It is never reported to user level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum SendOutcome {
    /// Partner not lockable or not receiving from us
    Retry,
    /// Handshake finished with this status for the sender
    Done(Result<(), IpcError>),
}

/// Whom a receiver is waiting for
#[derive(Clone, Default)]
pub enum Partner {
    /// Open wait: any sender
    #[default]
    Open,
    /// Closed wait on the nil id: nobody will ever send
    Nil,
    /// Closed wait on one sender, or the sender of an ongoing transfer
    Sender(Arc<dyn Sender>),
}

impl Partner {
    /// Id of the expected sender, if any
    pub fn id(&self) -> Option<ThreadId> {
        match self {
            Partner::Sender(s) => Some(s.sender_id()),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Partner::Open)
    }

    /// Whether this partner is the given sender
    pub fn is(&self, id: ThreadId) -> bool {
        self.id() == Some(id)
    }
}

impl fmt::Debug for Partner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partner::Open => f.write_str("Open"),
            Partner::Nil => f.write_str("Nil"),
            Partner::Sender(s) => write!(f, "Sender({:?})", s.sender_id()),
        }
    }
}

impl PartialEq for Partner {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Partner::Open, Partner::Open) | (Partner::Nil, Partner::Nil) => true,
            (Partner::Sender(a), Partner::Sender(b)) => a.sender_id() == b.sender_id(),
            _ => false,
        }
    }
}
