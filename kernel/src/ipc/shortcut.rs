//! IPC fast path
//!
//! Handles the common "send registers to a thread that already waits for
//! us, then maybe wait for the reply" case with one lookup and one switch.
//! Anything it cannot finish in one go is declined before the first change
//! to either thread, and the general path takes over.

use super::{IpcError, MsgDope, Partner, WaitSpec, NUM_REG_WORDS};
use crate::sched::{Thread, ThreadState};
use crate::trace::IpcEvent;
use crate::traits::SwitchMode;
use crate::Kernel;
use alloc::sync::Arc;

/// Why the fast path left a call to the general path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclineReason {
    /// Turned off in the configuration
    Disabled,
    /// Receive-only call
    NoSend,
    /// Long message or flexpage
    LongSend,
    /// Deceiving send that still switches
    Deceit,
    /// Nil, invalid or interrupt destination
    InvalidDest,
    /// Receive into a buffer or a flexpage window
    ReceiveNotRegister,
    /// A receive part that would not switch to the partner
    SwitchDisabled,
    FiniteTimeout,
    /// Open wait with a queued sender or an attached interrupt
    PendingSender,
    /// No thread with the destination id
    TcbUnmapped,
    /// Destination is not waiting for us
    NotReady,
    /// Destination is locked by someone else
    Locked,
}

/// Try the fast path for `cur`'s IPC frame.
///
/// Returns `true` if the call was handled and the frame holds its result.
pub fn ipc_short_cut(k: &Kernel, cur: &Arc<Thread>) -> bool {
    match try_short_cut(k, cur) {
        Ok(()) => true,
        Err(reason) => {
            log::debug!("shortcut declined for {:?}: {:?}", cur.id(), reason);
            k.trace.record(IpcEvent::ShortcutMiss {
                from: cur.id(),
                reason,
            });
            false
        }
    }
}

fn try_short_cut(k: &Kernel, cur: &Arc<Thread>) -> Result<(), DeclineReason> {
    if !k.config.shortcut {
        return Err(DeclineReason::Disabled);
    }

    let frame = *cur.regs().lock();
    let (snd, rcv) = (frame.snd_desc, frame.rcv_desc);
    let deceit_no_switch = k.config.deceit_bit_disables_switch && snd.deceit();

    if !snd.has_send() {
        return Err(DeclineReason::NoSend);
    }
    if snd.is_long_ipc() {
        return Err(DeclineReason::LongSend);
    }
    if snd.deceit() && !k.config.deceit_bit_disables_switch {
        return Err(DeclineReason::Deceit);
    }
    if frame.dest.is_nil() || frame.dest.is_invalid() || frame.dest.is_irq() {
        return Err(DeclineReason::InvalidDest);
    }

    let receive = rcv.has_receive();
    let mut sleep = false;
    if receive {
        if !rcv.is_register_ipc() {
            return Err(DeclineReason::ReceiveNotRegister);
        }
        if deceit_no_switch || !k.config.switch_on_ipc {
            return Err(DeclineReason::SwitchDisabled);
        }
        match frame.timeout.rcv() {
            WaitSpec::Micros(_) => return Err(DeclineReason::FiniteTimeout),
            WaitSpec::Never => sleep = true,
            WaitSpec::Zero => {}
        }
        if rcv.open_wait() && (cur.sender_count() > 0 || cur.irq_count() > 0) {
            return Err(DeclineReason::PendingSender);
        }
    }

    let guard = k.cpu_lock.lock();
    cur.state_del_dirty(&guard, ThreadState::CANCEL);

    let dst = k.lookup(frame.dest).ok_or(DeclineReason::TcbUnmapped)?;
    if !dst.sender_ok(cur.id()) {
        return Err(DeclineReason::NotReady);
    }
    if dst.thread_lock().test() {
        return Err(DeclineReason::Locked);
    }
    let dst_regs = dst.rcv_regs().ok_or(DeclineReason::NotReady)?;

    // past this point the call is ours
    {
        let mut f = dst_regs.lock();
        f.msg = frame.msg;
        f.src = cur.id();
        f.dope = MsgDope::new(NUM_REG_WORDS, 0);
    }
    dst.ipc().partner = Partner::Sender(cur.clone());
    dst.reset_timeout(k);
    dst.state_change_dirty(
        &guard,
        ThreadState::RECEIVING_MASK | ThreadState::IPC_IN_PROGRESS | ThreadState::TRANSFER_IN_PROGRESS,
        ThreadState::READY,
    );
    cur.set_receiver(Some(dst.id()));

    if receive {
        let partner = if rcv.open_wait() {
            Partner::Open
        } else {
            Partner::Sender(dst.clone())
        };
        {
            let mut ipc = cur.ipc();
            ipc.rcv_regs = Some(cur.regs().clone());
            ipc.partner = partner;
        }
        // overwritten by a reply
        let provisional = if sleep {
            IpcError::RecvCanceled
        } else {
            IpcError::RecvTimeout
        };
        cur.regs().lock().dope = MsgDope::from_error(provisional);
        let del = if sleep { ThreadState::READY } else { ThreadState::empty() };
        cur.state_change_dirty(&guard, del, ThreadState::RECEIVING | ThreadState::IPC_IN_PROGRESS);
    } else {
        cur.regs().lock().dope = MsgDope::default();
    }
    drop(guard);

    k.trace.record(IpcEvent::ShortcutHit {
        from: cur.id(),
        to: dst.id(),
    });
    log::trace!("shortcut {:?} -> {:?}", cur.id(), dst.id());

    if !deceit_no_switch || k.sched.can_preempt_current(cur, &dst) {
        k.sched.switch_exec_locked(cur, &dst, SwitchMode::NotHelping);
    } else {
        k.sched.ready_enqueue(&dst);
    }

    if receive {
        while !cur.state().contains(ThreadState::READY) {
            k.sched.schedule(cur);
        }
        // no reply (zero timeout) or canceled: the provisional dope stands
        cur.state_del(ThreadState::RECEIVING_MASK | ThreadState::IPC_IN_PROGRESS);
    }
    Ok(())
}
