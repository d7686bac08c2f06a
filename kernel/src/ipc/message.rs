//! IPC message types
//!
//! Register-level encodings of the L4 system-call interface: send and
//! receive descriptors, flexpages and the IPC register frame.

use super::{MsgDope, Timeout};
use crate::sched::ThreadId;
use alloc::sync::Arc;
use spin::Mutex;

/// Machine word
pub type Mword = usize;

/// Number of message words transferred in registers
pub const NUM_REG_WORDS: usize = 3;

/// Size of a machine word in bytes
pub const WORD_SIZE: usize = core::mem::size_of::<Mword>();

/// log2 of the page size
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes
pub const PAGE_SIZE: Mword = 1 << PAGE_SHIFT;

/// Mask selecting the page base of an address
pub const PAGE_MASK: Mword = !(PAGE_SIZE - 1);

/// Send descriptor.
///
/// Bit 0 asks for deceit, bit 1 sends a flexpage, the remaining bits
/// address a long message. All ones means "no send part".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SndDesc(pub Mword);

impl SndDesc {
    /// No send part
    pub const NONE: Self = Self(!0);
    /// Short register-only message
    pub const SHORT: Self = Self(0);
    /// Short message carrying one flexpage in words 0 and 1
    pub const MAP: Self = Self(2);

    /// Long message at `addr` (word aligned)
    pub const fn long(addr: Mword) -> Self {
        Self(addr & !3)
    }

    /// Same descriptor with the deceit bit set
    pub const fn with_deceit(self) -> Self {
        Self(self.0 | 1)
    }

    pub const fn has_send(self) -> bool {
        self.0 != !0
    }

    pub const fn deceit(self) -> bool {
        self.0 & 1 != 0
    }

    pub const fn map(self) -> bool {
        self.0 & 2 != 0
    }

    /// Anything beyond plain registers, including a flexpage
    pub const fn is_long_ipc(self) -> bool {
        self.0 & !1 != 0
    }

    pub const fn is_register_ipc(self) -> bool {
        self.0 & !1 == 0
    }

    /// Address of the long message, 0 for short messages
    pub const fn msg(self) -> Mword {
        self.0 & !3
    }
}

impl Default for SndDesc {
    fn default() -> Self {
        Self::NONE
    }
}

/// Receive descriptor.
///
/// Bit 0 requests an open wait, bit 1 accepts a flexpage into the window
/// described by the remaining bits (or, without bit 1, addresses a long
/// receive buffer). All ones means "no receive part".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RcvDesc(pub Mword);

impl RcvDesc {
    /// No receive part
    pub const NONE: Self = Self(!0);
    /// Closed wait, registers only
    pub const SHORT: Self = Self(0);
    /// Open wait, registers only
    pub const OPEN: Self = Self(1);

    /// Accept one flexpage into `window`
    pub const fn short_fpage(window: Fpage) -> Self {
        Self(2 | (window.0 & !3))
    }

    /// Receive a long message into the buffer at `addr`
    pub const fn long(addr: Mword) -> Self {
        Self(addr & !3)
    }

    /// Same descriptor as an open wait
    pub const fn open(self) -> Self {
        Self(self.0 | 1)
    }

    pub const fn has_receive(self) -> bool {
        self.0 != !0
    }

    pub const fn open_wait(self) -> bool {
        self.0 & 1 != 0
    }

    pub const fn rmap(self) -> bool {
        self.0 & 2 != 0
    }

    pub const fn is_register_ipc(self) -> bool {
        self.0 & !1 == 0
    }

    /// Address of the long receive buffer
    pub const fn msg(self) -> Mword {
        self.0 & !3
    }

    /// Receive window for a flexpage
    pub const fn fpage(self) -> Fpage {
        Fpage(self.0 & !3)
    }
}

impl Default for RcvDesc {
    fn default() -> Self {
        Self::NONE
    }
}

/// Flexpage: a size-aligned region of an address space.
///
/// Bit 0 grants instead of mapping, bit 1 allows writes, bits 2..7 hold the
/// log2 size and bits 12.. the base address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fpage(pub Mword);

impl Fpage {
    /// Size field denoting the complete address space
    pub const WHOLE_SPACE: u32 = 63;

    /// Region of `2^size_log2` bytes at `base`
    pub const fn new(base: Mword, size_log2: u32, write: bool, grant: bool) -> Self {
        Self(
            (base & PAGE_MASK)
                | ((size_log2 as Mword & 0x3f) << 2)
                | ((write as Mword) << 1)
                | grant as Mword,
        )
    }

    /// The complete address space
    pub const fn whole_space() -> Self {
        Self::new(0, Self::WHOLE_SPACE, true, false)
    }

    pub const fn base(self) -> Mword {
        self.0 & PAGE_MASK
    }

    pub const fn size_log2(self) -> u32 {
        ((self.0 >> 2) & 0x3f) as u32
    }

    pub const fn write(self) -> bool {
        self.0 & 2 != 0
    }

    pub const fn grant(self) -> bool {
        self.0 & 1 != 0
    }

    pub const fn is_whole_space(self) -> bool {
        self.size_log2() == Self::WHOLE_SPACE
    }

    /// Whether `addr` lies inside this region
    pub fn contains(self, addr: Mword) -> bool {
        if self.is_whole_space() {
            return true;
        }
        let size = 1usize.checked_shl(self.size_log2()).unwrap_or(0);
        size != 0 && addr.wrapping_sub(self.base()) < size
    }
}

/// IPC register frame.
///
/// The user-visible part of a thread's registers on IPC entry and exit.
/// `dope` and `src` are outputs; everything else is input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcFrame {
    /// Send descriptor
    pub snd_desc: SndDesc,
    /// Receive descriptor
    pub rcv_desc: RcvDesc,
    /// Send/receive/page-fault timeouts
    pub timeout: Timeout,
    /// Destination of the send part and source of a closed receive
    pub dest: ThreadId,
    /// Message registers
    pub msg: [Mword; NUM_REG_WORDS],
    /// Result dope
    pub dope: MsgDope,
    /// Sender of the received message
    pub src: ThreadId,
}

impl Default for IpcFrame {
    fn default() -> Self {
        Self {
            snd_desc: SndDesc::NONE,
            rcv_desc: RcvDesc::NONE,
            timeout: Timeout::NEVER,
            dest: ThreadId::NIL,
            msg: [0; NUM_REG_WORDS],
            dope: MsgDope::default(),
            src: ThreadId::NIL,
        }
    }
}

impl IpcFrame {
    /// Send-only frame
    pub fn send(dest: ThreadId, snd_desc: SndDesc, msg: [Mword; NUM_REG_WORDS], timeout: Timeout) -> Self {
        Self {
            snd_desc,
            dest,
            msg,
            timeout,
            ..Self::default()
        }
    }

    /// Receive-only frame; `from` is ignored for an open wait
    pub fn receive(from: ThreadId, rcv_desc: RcvDesc, timeout: Timeout) -> Self {
        Self {
            rcv_desc,
            dest: from,
            timeout,
            ..Self::default()
        }
    }

    /// Combined send and closed receive from the same partner
    pub fn call(dest: ThreadId, msg: [Mword; NUM_REG_WORDS], timeout: Timeout) -> Self {
        Self {
            snd_desc: SndDesc::SHORT,
            rcv_desc: RcvDesc::SHORT,
            dest,
            msg,
            timeout,
            ..Self::default()
        }
    }

    /// Copy the message registers into `dst`
    #[inline]
    pub fn copy_msg(&self, dst: &mut IpcFrame) {
        dst.msg = self.msg;
    }
}

/// A register frame shared between its owner and a sender poking a
/// message into it
pub type SharedFrame = Arc<Mutex<IpcFrame>>;

/// Wrap a frame for sharing
pub fn shared_frame(frame: IpcFrame) -> SharedFrame {
    Arc::new(Mutex::new(frame))
}
