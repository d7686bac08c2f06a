//! Page faults as IPC to the pager
//!
//! A faulting thread sends the fault address and instruction pointer to its
//! pager and waits for a flexpage reply that maps the missing page. The same
//! bridge serves user-mode faults from the trap handler and kernel-mode
//! faults taken while copying a long message, so whatever IPC the thread is
//! in the middle of is put aside for the duration and restored afterwards.

use super::{
    do_receive, do_send, prepare_receive, shared_frame, Fpage, IpcError, IpcFrame, Mword, Partner,
    RcvDesc, SharedFrame, SndDesc, Timeout,
};
use crate::sched::{Thread, ThreadId, ThreadState};
use crate::time::IpcTimeout;
use crate::trace::IpcEvent;
use crate::Kernel;
use alloc::sync::Arc;
use bitflags::bitflags;

bitflags! {
    /// Page-fault error code
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PfErr: Mword {
        /// Protection violation on a present page
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        /// Fault raised by user-mode code
        const USER = 1 << 2;
    }
}

/// Message a faulting thread sends to its pager.
///
/// Word 0 is the fault address with bit 1 set for writes, word 1 the
/// faulting instruction pointer (`!0` for faults inside the kernel). The
/// reply may map anywhere in our address space.
pub fn page_fault_msg(pfa: Mword, err: PfErr, ip: Mword) -> IpcFrame {
    let mut w0 = pfa & !3;
    if err.contains(PfErr::WRITE) {
        w0 |= 2;
    }
    let w1 = if err.contains(PfErr::USER) { ip } else { !0 };
    IpcFrame {
        snd_desc: SndDesc::SHORT,
        rcv_desc: RcvDesc::short_fpage(Fpage::whole_space()),
        msg: [w0, w1, 0],
        ..IpcFrame::default()
    }
}

/// IPC context of a thread that takes a page fault in the middle of an IPC.
/// Dropping it puts everything back.
struct SavedIpc<'a> {
    k: &'a Kernel,
    cur: &'a Thread,
    partner: Partner,
    rcv_regs: Option<SharedFrame>,
    receiver: Option<ThreadId>,
    timeout: Option<Arc<IpcTimeout>>,
    was_set: bool,
    bits: ThreadState,
}

impl<'a> SavedIpc<'a> {
    fn save(k: &'a Kernel, cur: &'a Thread) -> Self {
        let (partner, rcv_regs, receiver, timeout) = {
            let mut ipc = cur.ipc();
            (
                core::mem::take(&mut ipc.partner),
                ipc.rcv_regs.take(),
                ipc.receiver.take(),
                ipc.timeout.take(),
            )
        };
        let was_set = timeout.as_ref().is_some_and(|t| t.is_set());
        if let Some(t) = &timeout {
            t.reset(&*k.timer);
        }

        let bits = cur.state() & (ThreadState::IPC_MASK | ThreadState::TRANSFER_IN_PROGRESS);
        cur.state_del(bits);

        Self {
            k,
            cur,
            partner,
            rcv_regs,
            receiver,
            timeout,
            was_set,
            bits,
        }
    }
}

impl Drop for SavedIpc<'_> {
    fn drop(&mut self) {
        self.cur
            .state_change(ThreadState::IPC_MASK | ThreadState::TRANSFER_IN_PROGRESS, self.bits);
        {
            let mut ipc = self.cur.ipc();
            ipc.partner = core::mem::take(&mut self.partner);
            ipc.rcv_regs = self.rcv_regs.take();
            ipc.receiver = self.receiver.take();
            ipc.timeout = self.timeout.clone();
        }
        if self.was_set {
            if let Some(t) = &self.timeout {
                t.set_again(&*self.k.timer);
            }
        }
    }
}

/// Ask `cur`'s pager to resolve a fault at `pfa`.
///
/// `Ok` means the fault should be retried. For a user-mode fault that is
/// also the answer to most IPC failures: the thread simply faults again.
/// Kernel-mode faults report failures as receive-side errors for the long
/// transfer that took them.
pub fn handle_page_fault_pager(k: &Kernel, cur: &Arc<Thread>, pfa: Mword, err: PfErr) -> Result<(), IpcError> {
    let user = err.contains(PfErr::USER);
    if !user && cur.thread_lock().test() {
        panic!("{:?}: kernel page fault at {:#x} while locked", cur.id(), pfa);
    }

    let saved = SavedIpc::save(k, cur);
    let timeout = if saved.bits.is_empty() {
        Timeout::NEVER
    } else {
        cur.ipc().pf_timeout
    };

    let pager = cur.pager().and_then(|id| k.lookup(id));
    let (partner, dest) = match &pager {
        Some(p) => (Partner::Sender(p.clone()), p.id()),
        None => (Partner::Nil, ThreadId::NIL),
    };
    let regs = shared_frame(IpcFrame {
        dest,
        timeout,
        ..page_fault_msg(pfa, err, cur.user_ip())
    });
    prepare_receive(cur, partner, &regs);

    let frame = *regs.lock();
    let result = match do_send(k, cur, pager.as_ref(), &frame) {
        Err(e) => {
            if k.config.conservative {
                log::warn!("{:?}: page fault at {:#x}: send to pager failed: {}", cur.id(), pfa, e);
            }
            cur.state_del(ThreadState::RECEIVING_MASK | ThreadState::IPC_IN_PROGRESS);
            match (user, e) {
                (false, IpcError::SendTimeout) => Err(IpcError::RecvSendPfTimeout),
                (false, _) => Err(IpcError::RecvAborted),
                // no pager: retry the instruction unless we are being canceled
                (true, IpcError::NotExistent) if cur.state().contains(ThreadState::CANCEL) => {
                    Err(IpcError::RecvAborted)
                }
                (true, _) => Ok(()),
            }
        }
        Ok(()) => match do_receive(k, cur, timeout, &regs) {
            Err(e) if user => {
                if k.config.conservative {
                    log::warn!("{:?}: page fault at {:#x}: pager reply failed: {}", cur.id(), pfa, e);
                }
                Ok(())
            }
            Err(IpcError::RecvTimeout) => Err(IpcError::RecvRecvPfTimeout),
            Err(IpcError::NotExistent) => Err(IpcError::RecvAborted),
            Err(e) => Err(e),
            Ok(()) if regs.lock().msg[0] == !0 => Err(IpcError::RecvAborted),
            Ok(()) => Ok(()),
        },
    };

    drop(saved);

    log::trace!("page fault {:?} at {:#x}: {:?}", cur.id(), pfa, result);
    k.trace.record(IpcEvent::PageFault {
        thread: cur.id(),
        addr: pfa,
        result,
    });
    result
}
