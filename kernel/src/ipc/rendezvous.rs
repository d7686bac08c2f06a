//! The handshake: one sender meets one receiver
//!
//! [`ipc_send_regs`] runs on the sender with the receiver's thread lock
//! held. It copies the message registers, maps a flexpage for a short
//! message or sets both threads up for a long transfer, and wakes the
//! receiver. A receiver that is not waiting for us yields
//! [`SendOutcome::Retry`], never an error.

use super::{
    sender_dequeue, Fpage, IpcError, IpcFrame, MsgDope, Partner, SendOutcome, Timeout, TryLock,
    NUM_REG_WORDS, PAGE_MASK,
};
use crate::sched::{SwitchHint, Thread, ThreadState};
use crate::trace::IpcEvent;
use crate::Kernel;
use alloc::sync::Arc;

/// Make a receiver that got its message runnable
pub fn wake_receiver(k: &Kernel, receiver: &Arc<Thread>) {
    receiver.reset_timeout(k);
    receiver.state_change(
        ThreadState::RECEIVING_MASK
            | ThreadState::IPC_IN_PROGRESS
            | ThreadState::TRANSFER_IN_PROGRESS,
        ThreadState::READY,
    );
    k.sched.ready_enqueue(receiver);
}

/// Try to hand `regs` to `receiver`
pub fn ipc_send_regs(
    k: &Kernel,
    cur: &Arc<Thread>,
    receiver: &Arc<Thread>,
    regs: &IpcFrame,
) -> SendOutcome {
    match receiver.ipc_try_lock(k, cur) {
        TryLock::Acquired => {}
        TryLock::NotReady => return SendOutcome::Retry,
        TryLock::NotExistent => return SendOutcome::Done(Err(IpcError::NotExistent)),
    }

    if cur.state().contains(ThreadState::CANCEL) {
        receiver.thread_lock().clear(k, cur);
        return SendOutcome::Done(Err(IpcError::SendCanceled));
    }

    let Some(dst) = receiver.rcv_regs() else {
        receiver.thread_lock().clear(k, cur);
        return SendOutcome::Retry;
    };

    receiver.ipc().partner = Partner::Sender(cur.clone());
    receiver.state_add(ThreadState::TRANSFER_IN_PROGRESS);

    let snd = regs.snd_desc;
    if snd.deceit() && !k.config.deceit_bit_disables_switch {
        log::warn!("{:?}: deceiving IPC is not supported, sending undisguised", cur.id());
    }

    sender_dequeue(receiver, cur.as_ref());

    // our send timeout may have hit between the receiver waking and now
    if let Some(to) = cur.timeout() {
        to.reset(&*k.timer);
        if to.has_hit() {
            cur.state_add(ThreadState::IPC_IN_PROGRESS);
            if cur.state().contains(ThreadState::CANCEL) {
                cur.state_del(ThreadState::IPC_IN_PROGRESS);
            }
        }
    }

    let (dst_rcv, dst_timeout) = {
        let f = dst.lock();
        (f.rcv_desc, f.timeout)
    };
    let activate = !(k.config.deceit_bit_disables_switch && snd.deceit());

    let short = !snd.is_long_ipc() || (snd.msg() == 0 && (dst_rcv.is_register_ipc() || dst_rcv.rmap()));
    let result = if short {
        let mut result = Ok(());
        let mut dope = MsgDope::new(NUM_REG_WORDS, 0);
        if snd.map() {
            if !dst_rcv.rmap() {
                dope.set_error(IpcError::RecvMsgCut);
                result = Err(IpcError::SendMsgCut);
            } else {
                let mapped = k.mapper.fpage_map(
                    cur.space(),
                    Fpage(regs.msg[1]),
                    receiver.space(),
                    dst_rcv.fpage(),
                    regs.msg[0] & PAGE_MASK,
                );
                dope.combine(mapped);
                if mapped.has_error() {
                    result = Err(IpcError::SendMapFailed);
                }
            }
        }
        {
            let mut f = dst.lock();
            f.dope = dope;
            f.msg = regs.msg;
            f.src = cur.id();
        }

        let mut del = ThreadState::POLLING | ThreadState::SEND_IN_PROGRESS;
        if result.is_err() {
            del |= ThreadState::IPC_IN_PROGRESS;
        }
        cur.state_del(del);
        wake_receiver(k, receiver);
        if activate {
            receiver.thread_lock().set_switch_hint(SwitchHint::ActivateLockee);
        }
        result
    } else {
        cur.ipc().target_desc = dst_rcv;
        receiver.reset_timeout(k);
        receiver.ipc().pf_timeout = Timeout::pagefault(regs.timeout.snd_pfault());
        cur.ipc().pf_timeout = Timeout::pagefault(dst_timeout.rcv_pfault());
        {
            let mut f = dst.lock();
            f.dope = MsgDope::from_error(IpcError::RecvAborted);
            f.msg = regs.msg;
            f.src = cur.id();
        }

        receiver.state_change(
            ThreadState::RECEIVING | ThreadState::BUSY | ThreadState::READY,
            ThreadState::RCVLONG_IN_PROGRESS | ThreadState::IPC_IN_PROGRESS,
        );
        if receiver.state().contains(ThreadState::CANCEL) {
            receiver.state_change(ThreadState::IPC_IN_PROGRESS, ThreadState::READY);
        }
        cur.state_del(ThreadState::POLLING);
        Ok(())
    };

    log::trace!("rendezvous {:?} -> {:?}: {:?}", cur.id(), receiver.id(), result);
    k.trace.record(IpcEvent::Rendezvous {
        from: cur.id(),
        to: receiver.id(),
        result,
    });
    receiver.thread_lock().clear(k, cur);
    SendOutcome::Done(result)
}
