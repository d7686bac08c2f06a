//! The IPC system call
//!
//! [`sys_ipc`] decodes the caller's register frame, arms the receive part,
//! runs the send part and then waits for the reply. The result is left in
//! the frame's dope and returned.

use crate::driver::Irq;
use crate::ipc::{
    arm_receive, do_receive, do_send, prepare_receive, IpcError, IpcFrame, MsgDope, Partner, WaitSpec,
};
use crate::sched::{Thread, ThreadState};
use crate::Kernel;
use alloc::sync::Arc;

/// Reset the dope and record a failure
pub fn commit_ipc_failure(regs: &mut IpcFrame, e: IpcError) {
    regs.dope = MsgDope::from_error(e);
}

/// Record the outcome of an operation whose dope a partner may already have
/// written
pub fn commit_ipc_success(regs: &mut IpcFrame, r: Result<(), IpcError>) {
    if let Err(e) = r {
        regs.dope.set_error(e);
    }
}

/// Error recorded in the frame
pub fn get_ipc_err(regs: &IpcFrame) -> Result<(), IpcError> {
    regs.dope.result()
}

/// What a send to an interrupt id asks for
enum IrqRequest {
    Acknowledge(Arc<Irq>),
    Detach(Arc<Irq>),
}

/// Send to an interrupt id: with multi-attach, word 0 selects acknowledge
/// (0) or detach (1) of an interrupt we own
fn irq_request(k: &Kernel, cur: &Thread, frame: &IpcFrame) -> Result<IrqRequest, IpcError> {
    if !k.config.multi_irq_attach {
        return Err(IpcError::NotExistent);
    }
    let irq = k.irqs.lookup(frame.dest).ok_or(IpcError::NotExistent)?;
    if !irq.is_owned_by(cur) {
        return Err(IpcError::NotExistent);
    }
    match frame.msg[0] {
        0 => Ok(IrqRequest::Acknowledge(irq)),
        1 => Ok(IrqRequest::Detach(irq)),
        _ => Err(IpcError::NotExistent),
    }
}

/// Whom the receive part waits for
fn receive_partner(k: &Kernel, cur: &Thread, frame: &IpcFrame) -> Result<Partner, IpcError> {
    if frame.rcv_desc.open_wait() {
        return Ok(Partner::Open);
    }
    let from = frame.dest;
    if from.is_irq() {
        let irq = k.irqs.lookup(from).ok_or(IpcError::NotExistent)?;
        // a stranger may only ask to attach, which is a zero-timeout receive
        if !irq.is_owned_by(cur) && frame.timeout.rcv() != WaitSpec::Zero {
            return Err(IpcError::NotExistent);
        }
        return Ok(Partner::Sender(irq));
    }
    if from.is_nil() {
        return Ok(Partner::Nil);
    }
    let thread = k.lookup(from).ok_or(IpcError::NotExistent)?;
    Ok(Partner::Sender(thread))
}

/// A zero-timeout receive from an interrupt attaches the caller to it; one
/// from the nil id detaches the caller from all its interrupts
fn irq_association(k: &Kernel, cur: &Arc<Thread>, frame: &IpcFrame) -> Result<(), IpcError> {
    let multi = k.config.multi_irq_attach;
    if frame.dest.is_nil() {
        k.irqs.free_all(cur);
        return Ok(());
    }
    let irq = k.irqs.lookup(frame.dest).ok_or(IpcError::NotExistent)?;
    if !k.irqs.alloc(&irq, cur, !multi) {
        return Err(IpcError::NotExistent);
    }
    if !multi {
        k.irqs.free_all_except(cur, &irq);
    }
    Ok(())
}

/// Perform the IPC described by `cur`'s register frame
pub fn sys_ipc(k: &Kernel, cur: &Arc<Thread>) -> MsgDope {
    let regs = cur.regs().clone();
    let frame = {
        let mut f = regs.lock();
        f.dope = MsgDope::default();
        *f
    };
    let have_send = frame.snd_desc.has_send();
    let have_receive = frame.rcv_desc.has_receive();

    let fail = |e: IpcError| {
        let mut f = regs.lock();
        commit_ipc_failure(&mut f, e);
        f.dope
    };

    // argument errors are reported before anything changes
    let mut irq_req = None;
    let mut dest = None;
    if have_send {
        if frame.dest.is_irq() {
            match irq_request(k, cur, &frame) {
                Ok(req) => irq_req = Some(req),
                Err(e) => return fail(e),
            }
        } else {
            match k.lookup(frame.dest) {
                Some(t) if !frame.dest.is_nil() => dest = Some(t),
                _ => return fail(IpcError::NotExistent),
            }
        }
    }
    let partner = if have_receive {
        match receive_partner(k, cur, &frame) {
            Ok(p) => Some(p),
            Err(e) => return fail(e),
        }
    } else {
        None
    };

    if let Some(partner) = partner {
        prepare_receive(cur, partner, &regs);
    }

    if have_send {
        let sent = match irq_req {
            Some(req) => {
                match req {
                    IrqRequest::Acknowledge(irq) => irq.acknowledge(k, cur),
                    IrqRequest::Detach(irq) => {
                        k.irqs.free(&irq, cur);
                    }
                }
                if have_receive {
                    arm_receive(cur);
                }
                Ok(())
            }
            None => do_send(k, cur, dest.as_ref(), &frame),
        };
        if let Err(e) = sent {
            cur.state_del(ThreadState::RECEIVING_MASK | ThreadState::IPC_IN_PROGRESS);
            log::trace!("sys_ipc {:?}: send failed: {}", cur.id(), e);
            let mut f = regs.lock();
            commit_ipc_success(&mut f, Err(e));
            return f.dope;
        }
    }

    if !have_receive {
        cur.state_del(ThreadState::RECEIVING_MASK);
        return regs.lock().dope;
    }

    let received = do_receive(k, cur, frame.timeout, &regs);
    let closed = !frame.rcv_desc.open_wait() && (frame.dest.is_irq() || frame.dest.is_nil());
    if received == Err(IpcError::RecvTimeout) && closed && frame.timeout.rcv() == WaitSpec::Zero {
        if let Err(e) = irq_association(k, cur, &frame) {
            return fail(e);
        }
    }

    let dope = regs.lock().dope;
    dope
}
