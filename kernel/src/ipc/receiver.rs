//! Receiving side of the rendezvous

use super::{
    handle_page_fault_pager, ipc_continue, IpcError, Partner, SharedFrame, Timeout, WaitSpec,
};
use crate::sched::{LockResult, Thread, ThreadId, ThreadState};
use crate::syscall::{commit_ipc_success, get_ipc_err};
use crate::time::IpcTimeout;
use crate::Kernel;
use alloc::sync::Arc;

/// Outcome of a sender's attempt to lock its receiver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryLock {
    /// Receiver locked and waiting for this sender
    Acquired,
    /// Receiver exists but is not receiving from this sender; retry later
    NotReady,
    NotExistent,
}

impl Thread {
    /// Whether we are waiting for a message and would take it from `sender`
    pub fn sender_ok(&self, sender: ThreadId) -> bool {
        if !self
            .state()
            .contains(ThreadState::RECEIVING | ThreadState::IPC_IN_PROGRESS)
        {
            return false;
        }
        let ipc = self.ipc();
        match &ipc.partner {
            // first come, first served
            Partner::Open => ipc.senders.front().map_or(true, |s| s.sender_id() == sender),
            Partner::Sender(p) => p.sender_id() == sender,
            Partner::Nil => false,
        }
    }

    /// Whether `sender` has started a handshake with us
    pub fn in_ipc(&self, sender: ThreadId) -> bool {
        self.state().contains(ThreadState::TRANSFER_IN_PROGRESS) && self.ipc().partner.is(sender)
    }

    /// Whether `sender` is copying a long message to us
    pub fn in_long_ipc(&self, sender: ThreadId) -> bool {
        self.state().contains(ThreadState::RCVLONG_IN_PROGRESS) && self.ipc().partner.is(sender)
    }

    /// Lock this thread as the receiver of `cur`'s message.
    ///
    /// On [`TryLock::Acquired`] the caller owns our thread lock and must
    /// clear it.
    pub(crate) fn ipc_try_lock(&self, k: &Kernel, cur: &Arc<Thread>) -> TryLock {
        if !self.state().is_valid() {
            return TryLock::NotExistent;
        }
        match self.thread_lock().lock(k, cur) {
            LockResult::Invalid => return TryLock::NotExistent,
            LockResult::Busy => return TryLock::NotReady,
            LockResult::Acquired | LockResult::AlreadyOwned => {}
        }
        if !self.sender_ok(cur.id()) {
            self.thread_lock().clear(k, cur);
            return TryLock::NotReady;
        }
        TryLock::Acquired
    }
}

/// Arm `cur` to receive from `partner` into `regs`.
///
/// Runs before the send part of a combined operation, so a partner that
/// replies at once finds us receiving.
pub fn prepare_receive(cur: &Thread, partner: Partner, regs: &SharedFrame) {
    {
        let mut ipc = cur.ipc();
        ipc.rcv_regs = Some(regs.clone());
        ipc.partner = partner;
    }
    cur.state_change(ThreadState::TRANSFER_IN_PROGRESS, ThreadState::RECEIVING);

    let has_send = regs.lock().snd_desc.has_send();
    if !has_send {
        arm_receive(cur);
    }
}

/// Let a receive armed by [`prepare_receive`] start waiting, unless a
/// cancel is already pending.
///
/// A successful send does this through the rendezvous; an operation whose
/// send part never met a partner calls it directly.
pub fn arm_receive(cur: &Thread) {
    cur.state_add(ThreadState::IPC_IN_PROGRESS);
    if cur.state().contains(ThreadState::CANCEL) {
        cur.state_del(ThreadState::IPC_IN_PROGRESS);
    }
}

/// Wait for the message prepared by [`prepare_receive`].
///
/// Wakes a queued sender first, then sleeps until the message arrives, the
/// receive timeout hits or we are canceled. A long message is completed
/// here: the loop services the sender's page-in requests until the copy is
/// done.
pub fn do_receive(
    k: &Kernel,
    cur: &Arc<Thread>,
    timeout: Timeout,
    regs: &SharedFrame,
) -> Result<(), IpcError> {
    let mut armed: Option<Arc<IpcTimeout>> = None;
    let mut timeout_checked = false;

    let waiting = ThreadState::RECEIVING | ThreadState::IPC_IN_PROGRESS;
    while cur.state() & (waiting | ThreadState::CANCEL) == waiting {
        // Busy closes the window between waking a sender and going to sleep
        if !cur.state_change_safely(waiting, ThreadState::BUSY | waiting) {
            break;
        }

        let sender = {
            let ipc = cur.ipc();
            match &ipc.partner {
                Partner::Open => ipc.senders.front().cloned(),
                Partner::Sender(p) if p.in_sender_list() && p.receiver_id() == Some(cur.id()) => {
                    Some(p.clone())
                }
                _ => None,
            }
        };
        if let Some(sender) = sender {
            sender.ipc_receiver_ready(k, cur);
        }

        if !timeout_checked {
            timeout_checked = true;
            match timeout.rcv() {
                WaitSpec::Zero => {
                    if !cur.state_change_safely(waiting | ThreadState::BUSY, ThreadState::RECEIVING) {
                        cur.state_del(ThreadState::BUSY);
                    }
                    break;
                }
                WaitSpec::Micros(us) => armed = Some(cur.arm_timeout(k, us)),
                WaitSpec::Never => {}
            }
        }

        if !cur.state_change_safely(
            waiting | ThreadState::READY | ThreadState::BUSY,
            waiting,
        ) {
            cur.state_del(ThreadState::BUSY);
            continue;
        }
        k.sched.schedule(cur);
    }

    if let Some(t) = armed {
        t.reset(&*k.timer);
        cur.set_timeout(None);
    }

    let long = ThreadState::RCVLONG_IN_PROGRESS | ThreadState::IPC_IN_PROGRESS;
    while cur.state() & (ThreadState::RECEIVING | long) == long {
        let pagein = cur.ipc().pagein.take();
        if let Some(req) = pagein {
            let code = handle_page_fault_pager(k, cur, req.addr, req.err);
            cur.state_add(ThreadState::BUSY_LONG);
            if ipc_continue(k, cur, &req.applicant, code).is_err() {
                cur.state_del(long | ThreadState::BUSY_LONG);
                break;
            }
        } else {
            cur.state_add(ThreadState::BUSY_LONG);
        }

        if cur.state_change_safely(
            long | ThreadState::BUSY_LONG | ThreadState::READY,
            long,
        ) {
            k.sched.schedule(cur);
        }
    }

    let st = cur.state();
    // a sender parked on a page-in we will no longer service
    let orphaned = if st.contains(ThreadState::RCVLONG_IN_PROGRESS) {
        cur.ipc().pagein.take()
    } else {
        None
    };
    if st.intersects(ThreadState::RECEIVING_MASK) {
        let err = if st.contains(ThreadState::BUSY) {
            IpcError::RecvAborted
        } else if st.contains(ThreadState::RCVLONG_IN_PROGRESS) {
            regs.lock().dope.error().unwrap_or(IpcError::RecvAborted)
        } else if st.contains(ThreadState::CANCEL) {
            IpcError::RecvCanceled
        } else {
            IpcError::RecvTimeout
        };
        commit_ipc_success(&mut regs.lock(), Err(err));
        cur.state_del(
            ThreadState::RECEIVING_MASK
                | ThreadState::IPC_IN_PROGRESS
                | ThreadState::BUSY_LONG
                | ThreadState::BUSY,
        );
    }
    cur.state_del(ThreadState::BUSY | ThreadState::BUSY_LONG);

    if let Some(req) = orphaned {
        if let Err(e) = ipc_continue(k, cur, &req.applicant, Err(IpcError::RecvAborted)) {
            log::debug!("{:?}: page-in of {:?} dropped: {}", cur.id(), req.applicant.id(), e);
        }
    }

    let result = get_ipc_err(&regs.lock());
    result
}
