//! Sending side of the rendezvous
//!
//! A sender that finds its receiver not ready queues itself on the
//! receiver's sender list and polls: it sleeps with `Polling` set until the
//! receiver's [`Sender::ipc_receiver_ready`] clears it, then retries the
//! handshake.

use super::{do_send_long, ipc_send_regs, IpcError, IpcFrame, SendOutcome, WaitSpec};
use crate::sched::{SwitchHint, Thread, ThreadId, ThreadState, LockResult};
use crate::time::IpcTimeout;
use crate::Kernel;
use alloc::sync::Arc;

/// Anything that can sit in a receiver's sender queue
pub trait Sender: Send + Sync {
    /// Id the receiver sees as the message source
    fn sender_id(&self) -> ThreadId;

    /// Receiver this sender is trying to reach
    fn receiver_id(&self) -> Option<ThreadId>;

    fn in_sender_list(&self) -> bool;

    fn set_in_sender_list(&self, queued: bool);

    /// The receiver (`cur`) is now waiting for us
    fn ipc_receiver_ready(&self, k: &Kernel, cur: &Arc<Thread>);

    /// The receiver was killed while we were queued or transferring
    fn ipc_receiver_aborted(&self, k: &Kernel);
}

/// Append `sender` to `receiver`'s queue unless it is already queued
pub fn sender_enqueue(receiver: &Thread, sender: Arc<dyn Sender>) {
    if sender.in_sender_list() {
        return;
    }
    sender.set_in_sender_list(true);
    receiver.ipc().senders.push_back(sender);
}

/// Remove `sender` from `receiver`'s queue
pub fn sender_dequeue(receiver: &Thread, sender: &dyn Sender) {
    let id = sender.sender_id();
    receiver.ipc().senders.retain(|s| s.sender_id() != id);
    sender.set_in_sender_list(false);
}

impl Sender for Thread {
    fn sender_id(&self) -> ThreadId {
        self.id()
    }

    fn receiver_id(&self) -> Option<ThreadId> {
        self.receiver()
    }

    fn in_sender_list(&self) -> bool {
        self.in_sender_list_flag()
    }

    fn set_in_sender_list(&self, queued: bool) {
        self.set_in_sender_list_flag(queued);
    }

    fn ipc_receiver_ready(&self, k: &Kernel, cur: &Arc<Thread>) {
        let locked = self.thread_lock().lock(k, cur);
        if locked == LockResult::Invalid {
            return;
        }

        let old = self.state_change(ThreadState::POLLING, ThreadState::empty());
        if old.contains(ThreadState::POLLING) {
            self.state_add(ThreadState::READY);
            if let Some(me) = self.arc() {
                k.sched.ready_enqueue(&me);
            }
            self.thread_lock().set_switch_hint(SwitchHint::ActivateLockee);
        }

        if locked == LockResult::Acquired {
            self.thread_lock().clear(k, cur);
        }
    }

    fn ipc_receiver_aborted(&self, k: &Kernel) {
        self.set_receiver(None);
        let st = self.state();
        if st.contains(ThreadState::SEND_IN_PROGRESS) {
            self.ipc().continue_code = Some(Err(IpcError::SendAborted));
        }
        if st.contains(ThreadState::IPC_IN_PROGRESS) {
            self.state_change(ThreadState::IPC_IN_PROGRESS, ThreadState::READY);
            if let Some(me) = self.arc() {
                k.sched.ready_enqueue(&me);
            }
        }
    }
}

/// Send the message in `regs` to `receiver`, waiting as the send timeout
/// allows, then finish a long transfer if the handshake started one.
pub fn do_send(
    k: &Kernel,
    cur: &Arc<Thread>,
    receiver: Option<&Arc<Thread>>,
    regs: &IpcFrame,
) -> Result<(), IpcError> {
    let receiver = match receiver {
        Some(r) if r.state().is_valid() => r,
        _ => return Err(IpcError::NotExistent),
    };

    cur.set_receiver(Some(receiver.id()));
    cur.state_add(ThreadState::POLLING | ThreadState::IPC_IN_PROGRESS | ThreadState::SEND_IN_PROGRESS);
    if cur.state().contains(ThreadState::CANCEL) {
        cur.state_del(ThreadState::SENDING_MASK | ThreadState::IPC_IN_PROGRESS);
        return Err(IpcError::SendCanceled);
    }

    sender_enqueue(receiver, cur.clone());

    let mut timeout: Option<Arc<IpcTimeout>> = None;
    let mut first = true;
    let mut result = loop {
        if let SendOutcome::Done(r) = ipc_send_regs(k, cur, receiver, regs) {
            break r;
        }

        if first {
            first = false;
            match regs.timeout.snd() {
                WaitSpec::Zero => break Err(IpcError::SendTimeout),
                WaitSpec::Micros(us) => timeout = Some(cur.arm_timeout(k, us)),
                WaitSpec::Never => {}
            }
        }

        if cur.state().contains(ThreadState::CANCEL) {
            break Err(IpcError::SendCanceled);
        }

        // sleep until the receiver clears Polling, a timeout or a cancel
        if cur.state_change_safely(
            ThreadState::IPC_IN_PROGRESS | ThreadState::POLLING | ThreadState::READY,
            ThreadState::IPC_IN_PROGRESS | ThreadState::POLLING,
        ) {
            k.sched.schedule(cur);
        }
        cur.state_add(ThreadState::POLLING);

        if cur.state().contains(ThreadState::CANCEL) {
            break Err(IpcError::SendCanceled);
        }
        if timeout.as_ref().is_some_and(|t| t.has_hit()) {
            break Err(IpcError::SendTimeout);
        }
    };

    if let Some(t) = timeout {
        t.reset(&*k.timer);
        cur.set_timeout(None);
    }

    if cur.in_sender_list_flag() {
        sender_dequeue(receiver, cur.as_ref());
    }

    if result.is_ok() && cur.state().contains(ThreadState::SEND_IN_PROGRESS) {
        result = do_send_long(k, cur, receiver, regs);
    }

    let old = cur.state_del(ThreadState::SENDING_MASK);
    if !old.contains(ThreadState::RECEIVING) {
        cur.state_del(ThreadState::IPC_IN_PROGRESS);
    }

    if let Err(e) = result {
        log::trace!("send {:?} -> {:?} failed: {}", cur.id(), receiver.id(), e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{MsgDope, RcvDesc, SndDesc, Timeout, NUM_REG_WORDS};
    use crate::traits::mock::{ipc, Harness};

    #[test]
    fn test_enqueue_is_idempotent() {
        let h = Harness::new();
        let r = h.thread(1, 0, 10);
        let s = h.thread(2, 0, 10);

        sender_enqueue(&r, s.clone());
        sender_enqueue(&r, s.clone());
        assert_eq!(r.sender_count(), 1);
        assert!(s.in_sender_list());

        sender_dequeue(&r, s.as_ref());
        assert_eq!(r.sender_count(), 0);
        assert!(!s.in_sender_list());
    }

    #[test]
    fn test_zero_send_timeout_does_not_block() {
        let h = Harness::new();
        let r = h.thread(1, 0, 10);
        let s = h.thread(2, 0, 20);

        let dest = r.id();
        let out = h.spawn(&s, move |k, me| {
            ipc(k, me, IpcFrame::send(dest, SndDesc::SHORT, [42, 0, 0], Timeout::ZERO))
        });
        h.run();

        let frame = out.take().unwrap();
        assert_eq!(frame.dope, MsgDope::from_error(IpcError::SendTimeout));
        assert_eq!(h.now(), 0);
        // only the initial dispatch
        assert_eq!(h.switches(), 1);
        assert_eq!(r.sender_count(), 0);
        assert_eq!(s.state(), ThreadState::READY);
    }

    #[test]
    fn test_finite_send_timeout_expires() {
        let h = Harness::new();
        let r = h.thread(1, 0, 10);
        let s = h.thread(2, 0, 20);

        let dest = r.id();
        let out = h.spawn(&s, move |k, me| {
            let t = Timeout::NEVER.with_snd(1, 10);
            ipc(k, me, IpcFrame::send(dest, SndDesc::SHORT, [0; NUM_REG_WORDS], t))
        });
        h.run();

        assert_eq!(out.take().unwrap().dope.error(), Some(IpcError::SendTimeout));
        assert_eq!(h.now(), 1024);
        assert_eq!(h.armed_count(), 0);
        assert!(!s.state().intersects(ThreadState::IPC_MASK));
    }

    #[test]
    fn test_send_before_receive_is_delivered() {
        let h = Harness::new();
        let s = h.thread(1, 0, 20);
        let r = h.thread(2, 0, 10);

        // sender runs first and queues itself
        let dest = r.id();
        let sent = h.spawn(&s, move |k, me| {
            ipc(k, me, IpcFrame::send(dest, SndDesc::SHORT, [7, 8, 9], Timeout::NEVER))
        });
        let got = h.spawn(&r, |k, me| {
            ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::NEVER))
        });
        h.run();

        assert_eq!(sent.take().unwrap().dope, MsgDope::default());
        let frame = got.take().unwrap();
        assert_eq!(frame.msg, [7, 8, 9]);
        assert_eq!(frame.src, s.id());
        assert_eq!(frame.dope, MsgDope::new(NUM_REG_WORDS, 0));
        assert_eq!(s.state(), ThreadState::READY);
        assert_eq!(r.state(), ThreadState::READY);
    }

    #[test]
    fn test_send_to_missing_thread() {
        let h = Harness::new();
        let s = h.thread(1, 0, 10);
        let out = h.spawn(&s, |k, me| {
            ipc(k, me, IpcFrame::send(ThreadId::new(9, 0), SndDesc::SHORT, [0; NUM_REG_WORDS], Timeout::NEVER))
        });
        h.run();
        assert_eq!(out.take().unwrap().dope, MsgDope::from_error(IpcError::NotExistent));
    }
}
