//! Long IPC payload transfer
//!
//! After the handshake took the long path, the sender copies its message
//! buffer into the receiver's, one word at a time, while both stay in IPC.
//!
//! ```text
//! buffer:  +-------+--------+--------+-----
//!          | count | word 0 | word 1 | ...
//!          +-------+--------+--------+-----
//! ```
//!
//! For the sender `count` is the number of payload words; for the receiver
//! it is the buffer capacity. A fault on the sender's side is handled right
//! away through the sender's pager. A fault on the receiver's side becomes a
//! page-in request: the sender parks it on the receiver, wakes it and waits
//! until the receiver has asked its own pager and called [`ipc_continue`].

use super::{handle_page_fault_pager, IpcError, IpcFrame, Mword, MsgDope, PfErr, NUM_REG_WORDS, PAGE_MASK, WORD_SIZE};
use crate::sched::{PageinRequest, Thread, ThreadState};
use crate::trace::IpcEvent;
use crate::traits::{PageFault, SwitchMode};
use crate::Kernel;
use alloc::sync::Arc;

/// Error pair for the sender and the receiver of an aborted transfer
type Abort = (IpcError, IpcError);

const ABORTED: Abort = (IpcError::SendAborted, IpcError::RecvAborted);

struct Copier<'a> {
    k: &'a Kernel,
    cur: &'a Arc<Thread>,
    receiver: &'a Arc<Thread>,
    /// Page of the last fault and how often it faulted in a row
    last_fault: Option<Mword>,
    retries: u32,
}

impl Copier<'_> {
    fn check(&self) -> Result<(), Abort> {
        if self.cur.state().contains(ThreadState::CANCEL) {
            return Err(ABORTED);
        }
        if !self.receiver.in_long_ipc(self.cur.id()) {
            return Err(ABORTED);
        }
        Ok(())
    }

    fn note_fault(&mut self, addr: Mword) {
        let page = addr & PAGE_MASK;
        if self.last_fault == Some(page) {
            self.retries += 1;
        } else {
            self.last_fault = Some(page);
            self.retries = 1;
        }
        if self.retries > self.k.config.pagein_retry_limit {
            panic!(
                "long IPC {:?} -> {:?}: page-in of {:#x} still faulting after {} attempts",
                self.cur.id(),
                self.receiver.id(),
                addr,
                self.retries - 1
            );
        }
    }

    fn sender_word(&mut self, addr: Mword) -> Result<Mword, Abort> {
        loop {
            self.check()?;
            match self.k.mapper.read_word(self.cur.space(), addr) {
                Ok(w) => {
                    self.last_fault = None;
                    return Ok(w);
                }
                Err(pf) => {
                    self.note_fault(pf.addr);
                    handle_page_fault_pager(self.k, self.cur, pf.addr, PfErr::empty()).map_err(|e| match e {
                        IpcError::RecvSendPfTimeout | IpcError::RecvRecvPfTimeout => (e.to_send_side(), e),
                        _ => ABORTED,
                    })?;
                }
            }
        }
    }

    fn on_receiver<T>(&mut self, op: impl Fn(&Kernel, &Thread) -> Result<T, PageFault>) -> Result<T, Abort> {
        loop {
            self.check()?;
            match op(self.k, self.receiver.as_ref()) {
                Ok(v) => {
                    self.last_fault = None;
                    return Ok(v);
                }
                Err(pf) => {
                    self.note_fault(pf.addr);
                    let err = if pf.write { PfErr::WRITE } else { PfErr::empty() };
                    set_pagein_request(self.k, self.receiver, pf.addr, err, self.cur);
                    wait_for_continue(self.k, self.cur).map_err(|_| ABORTED)?;
                }
            }
        }
    }

    /// Copy the payload; returns the number of words copied and whether
    /// the message was cut
    fn copy(&mut self, snd_buf: Mword, rcv_buf: Option<Mword>) -> Result<(usize, bool), Abort> {
        let count = if snd_buf == 0 { 0 } else { self.sender_word(snd_buf)? };
        let capacity = match rcv_buf {
            Some(buf) => self.on_receiver(|k, r| k.mapper.read_word(r.space(), buf))?,
            None => 0,
        };

        // payload words must not run past the end of either address space
        let reachable = |base: Mword| (Mword::MAX - base) / WORD_SIZE;
        let room = match rcv_buf {
            Some(buf) => capacity.min(reachable(buf)),
            None => 0,
        };
        let n = count.min(room).min(reachable(snd_buf));
        if let Some(buf) = rcv_buf {
            for i in 0..n {
                let off = WORD_SIZE * (1 + i);
                let w = self.sender_word(snd_buf + off)?;
                self.on_receiver(|k, r| k.mapper.write_word(r.space(), buf + off, w))?;
            }
        }
        Ok((n, count > n))
    }
}

/// Leave a page-in request for `receiver` and wake it
pub(crate) fn set_pagein_request(k: &Kernel, receiver: &Arc<Thread>, addr: Mword, err: PfErr, applicant: &Arc<Thread>) {
    receiver.ipc().pagein = Some(PageinRequest {
        addr,
        err,
        applicant: applicant.clone(),
    });
    receiver.state_change(ThreadState::BUSY_LONG, ThreadState::READY);
    k.sched.ready_enqueue(receiver);
}

fn wait_for_continue(k: &Kernel, cur: &Arc<Thread>) -> Result<(), IpcError> {
    loop {
        let code = cur.ipc().continue_code.take();
        if let Some(code) = code {
            return code;
        }
        if cur.state().contains(ThreadState::CANCEL) {
            return Err(IpcError::SendAborted);
        }
        if cur.state_change_safely(ThreadState::READY, ThreadState::empty()) {
            k.sched.schedule(cur);
        }
    }
}

/// Copy the long message described by `regs` to `receiver`, whose
/// handshake already completed
pub fn do_send_long(k: &Kernel, cur: &Arc<Thread>, receiver: &Arc<Thread>, regs: &IpcFrame) -> Result<(), IpcError> {
    let target = {
        let mut ipc = cur.ipc();
        ipc.continue_code = None;
        ipc.target_desc
    };
    let rcv_buf = if target.is_register_ipc() || target.rmap() || target.msg() == 0 {
        None
    } else {
        Some(target.msg())
    };

    let mut copier = Copier {
        k,
        cur,
        receiver,
        last_fault: None,
        retries: 0,
    };
    let (result, dope, words) = match copier.copy(regs.snd_desc.msg(), rcv_buf) {
        Ok((n, cut)) => {
            let mut dope = MsgDope::new(NUM_REG_WORDS + n, 0);
            if cut {
                dope.set_error(IpcError::RecvMsgCut);
                (Err(IpcError::SendMsgCut), dope, n)
            } else {
                (Ok(()), dope, n)
            }
        }
        Err((snd, rcv)) => {
            let mut dope = MsgDope::new(NUM_REG_WORDS, 0);
            dope.set_error(rcv);
            (Err(snd), dope, 0)
        }
    };

    if receiver.in_long_ipc(cur.id()) {
        if let Some(f) = receiver.rcv_regs() {
            f.lock().dope = dope;
        }
        receiver.state_change(
            ThreadState::RCVLONG_IN_PROGRESS
                | ThreadState::IPC_IN_PROGRESS
                | ThreadState::TRANSFER_IN_PROGRESS
                | ThreadState::BUSY_LONG,
            ThreadState::READY,
        );
        k.sched.ready_enqueue(receiver);
    }

    if let Err(e) = result {
        log::debug!("long IPC {:?} -> {:?} ended: {}", cur.id(), receiver.id(), e);
    }
    k.trace.record(IpcEvent::LongTransfer {
        from: cur.id(),
        to: receiver.id(),
        words,
        result,
    });
    result
}

/// Resume `sender` after servicing its page-in request with result `code`
pub fn ipc_continue(k: &Kernel, cur: &Arc<Thread>, sender: &Arc<Thread>, code: Result<(), IpcError>) -> Result<(), IpcError> {
    if !sender.state().contains(ThreadState::SEND_IN_PROGRESS) || sender.receiver() != Some(cur.id()) {
        return Err(IpcError::RecvAborted);
    }
    sender.ipc().continue_code = Some(code);
    sender.state_change(ThreadState::empty(), ThreadState::READY);
    k.sched.ready_enqueue(sender);
    if k.config.switch_on_ipc {
        k.sched.switch_exec_locked(cur, sender, SwitchMode::NotHelping);
    }
    Ok(())
}
