//! Trap-layer entry points
//!
//! The architecture code calls into these on page faults, other exceptions
//! and the IPC system call, and acts on the returned verdict.

use crate::ipc::{
    do_receive, do_send, handle_page_fault_pager, ipc_short_cut, prepare_receive, shared_frame,
    IpcError, IpcFrame, Mword, MsgDope, Partner, PfErr, Timeout,
};
use crate::sched::{Thread, ThreadState};
use crate::syscall::sys_ipc;
use crate::Kernel;
use alloc::sync::Arc;

/// Trap number of a page fault
pub const TRAP_PAGE_FAULT: Mword = 14;

/// Trap number reported for a system call of an alien thread
pub const TRAP_SYSCALL: Mword = 0x30;

/// What the trap layer does with the thread after a fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapVerdict {
    /// Return to the faulting instruction
    Resume,
    /// Enter the thread's own exception handler
    Reflect { handler_pc: Mword },
    Kill,
}

/// How a system call returns to user level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallExit {
    /// Back to user level with this dope
    Return(MsgDope),
    /// Re-execute the system call instruction
    Restart,
}

fn unhandled(cur: &Thread, e: IpcError) -> TrapVerdict {
    match cur.exception_handler() {
        Some(handler_pc) => TrapVerdict::Reflect { handler_pc },
        None => {
            log::warn!("{:?}: unhandled fault ({}), killing", cur.id(), e);
            TrapVerdict::Kill
        }
    }
}

/// Report trap `trap` with `code` to `cur`'s pager and wait for its answer
pub fn exception_ipc(k: &Kernel, cur: &Arc<Thread>, trap: Mword, code: Mword) -> Result<(), IpcError> {
    let pager = cur.pager().and_then(|id| k.lookup(id)).ok_or(IpcError::NotExistent)?;
    let regs = shared_frame(IpcFrame::call(pager.id(), [trap, code, cur.user_ip()], Timeout::NEVER));
    prepare_receive(cur, Partner::Sender(pager.clone()), &regs);
    let frame = *regs.lock();
    if let Err(e) = do_send(k, cur, Some(&pager), &frame) {
        cur.state_del(ThreadState::RECEIVING_MASK | ThreadState::IPC_IN_PROGRESS);
        return Err(e);
    }
    do_receive(k, cur, Timeout::NEVER, &regs)
}

/// Page fault at `addr` raised by the instruction at `pc`
pub fn handle_page_fault(k: &Kernel, cur: &Arc<Thread>, addr: Mword, err: PfErr, pc: Mword) -> TrapVerdict {
    cur.state_del(ThreadState::CANCEL);
    cur.set_user_ip(pc);

    let result = if cur.state().contains(ThreadState::ALIEN) {
        exception_ipc(k, cur, TRAP_PAGE_FAULT, addr)
    } else {
        handle_page_fault_pager(k, cur, addr, err)
    };
    match result {
        Ok(()) => TrapVerdict::Resume,
        Err(e) => unhandled(cur, e),
    }
}

/// Any other exception
pub fn handle_exception(k: &Kernel, cur: &Arc<Thread>, trap: Mword, code: Mword, pc: Mword) -> TrapVerdict {
    cur.state_del(ThreadState::CANCEL);
    cur.set_user_ip(pc);

    if !cur.state().contains(ThreadState::ALIEN) {
        return unhandled(cur, IpcError::NotExistent);
    }
    match exception_ipc(k, cur, trap, code) {
        Ok(()) => TrapVerdict::Resume,
        Err(e) => unhandled(cur, e),
    }
}

/// IPC system call entry: fast path first, general path otherwise
pub fn syscall_entry(k: &Kernel, cur: &Arc<Thread>) -> SyscallExit {
    cur.state_del(ThreadState::CANCEL);

    let st = cur.state();
    if st.contains(ThreadState::ALIEN) && !st.contains(ThreadState::DIS_ALIEN) {
        if let Err(e) = exception_ipc(k, cur, TRAP_SYSCALL, 0) {
            log::debug!("{:?}: system call report failed: {}", cur.id(), e);
        }
        cur.state_add(ThreadState::DIS_ALIEN);
        return SyscallExit::Restart;
    }
    cur.state_del(ThreadState::DIS_ALIEN);

    if k.config.shortcut && ipc_short_cut(k, cur) {
        return SyscallExit::Return(cur.regs().lock().dope);
    }
    SyscallExit::Return(sys_ipc(k, cur))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{RcvDesc, SndDesc, NUM_REG_WORDS};
    use crate::sched::ThreadId;
    use crate::traits::mock::{ipc, pager_loop, Harness};

    /// Pager that answers one report and returns it
    fn one_shot_pager(k: &Kernel, me: &Arc<Thread>) -> IpcFrame {
        let report = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::NEVER));
        ipc(k, me, IpcFrame::send(report.src, SndDesc::SHORT, [0; NUM_REG_WORDS], Timeout::NEVER));
        report
    }

    #[test]
    fn test_resolved_fault_resumes() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        let pager = h.thread(2, 0, 30);
        t.set_pager(Some(pager.id()));
        let spaces = h.spaces.clone();
        h.spawn(&pager, move |k, me| pager_loop(k, me, &spaces, 0x9000_0000));

        let out = h.spawn(&t, |k, me| handle_page_fault(k, me, 0x5008, PfErr::USER, 0x400));
        h.run();
        assert_eq!(out.take().unwrap(), TrapVerdict::Resume);
        assert!(h.spaces.is_mapped(t.space(), 0x5000));
        assert_eq!(t.user_ip(), 0x400);
    }

    #[test]
    fn test_fault_without_pager_is_retried() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        let out = h.spawn(&t, |k, me| handle_page_fault(k, me, 0x5000, PfErr::USER, 0x400));
        h.run();
        assert_eq!(out.take().unwrap(), TrapVerdict::Resume);
        assert!(!h.spaces.is_mapped(t.space(), 0x5000));
    }

    #[test]
    fn test_unresolved_fault_kills_or_reflects() {
        let h = Harness::new();
        let plain = h.thread(1, 0, 10);
        let handled = h.thread(2, 0, 10);
        let pager = h.thread(3, 0, 30);
        plain.set_pager(Some(pager.id()));
        handled.set_pager(Some(pager.id()));
        handled.set_exception_handler(Some(0xdead));

        // answers every fault with a refusal
        h.spawn(&pager, |k, me| {
            let mut frame = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::NEVER));
            loop {
                let reply = IpcFrame {
                    rcv_desc: RcvDesc::OPEN,
                    ..IpcFrame::send(frame.src, SndDesc::SHORT, [!0; NUM_REG_WORDS], Timeout::NEVER)
                };
                frame = ipc(k, me, reply);
            }
        });

        let a = h.spawn(&plain, |k, me| handle_page_fault(k, me, 0x5000, PfErr::USER, 0x400));
        let b = h.spawn(&handled, |k, me| handle_page_fault(k, me, 0x5000, PfErr::USER, 0x400));
        h.run();
        assert_eq!(a.take().unwrap(), TrapVerdict::Kill);
        assert_eq!(b.take().unwrap(), TrapVerdict::Reflect { handler_pc: 0xdead });
    }

    #[test]
    fn test_alien_exception_is_reported() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        let pager = h.thread(2, 0, 30);
        t.set_pager(Some(pager.id()));
        t.state_add(ThreadState::ALIEN);
        let report = h.spawn(&pager, one_shot_pager);

        let out = h.spawn(&t, |k, me| handle_exception(k, me, 13, 8, 0x700));
        h.run();
        assert_eq!(out.take().unwrap(), TrapVerdict::Resume);
        let report = report.take().unwrap();
        assert_eq!(report.msg, [13, 8, 0x700]);
        assert_eq!(report.src, t.id());
    }

    #[test]
    fn test_exception_of_ordinary_thread() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        let out = h.spawn(&t, |k, me| {
            let first = handle_exception(k, me, 6, 0, 0x100);
            me.set_exception_handler(Some(0x2000));
            (first, handle_exception(k, me, 6, 0, 0x100))
        });
        h.run();
        assert_eq!(
            out.take().unwrap(),
            (TrapVerdict::Kill, TrapVerdict::Reflect { handler_pc: 0x2000 })
        );
    }

    #[test]
    fn test_alien_syscall_reported_then_restarted() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        let idle = h.thread(3, 0, 5);
        let pager = h.thread(2, 0, 30);
        t.set_pager(Some(pager.id()));
        t.state_add(ThreadState::ALIEN);
        let report = h.spawn(&pager, one_shot_pager);

        let dest = idle.id();
        let out = h.spawn(&t, move |k, me| {
            *me.regs().lock() = IpcFrame::send(dest, SndDesc::SHORT, [1, 2, 3], Timeout::ZERO);
            let first = syscall_entry(k, me);
            let disabled = me.state().contains(ThreadState::DIS_ALIEN);
            let second = syscall_entry(k, me);
            (first, disabled, second, me.state().contains(ThreadState::DIS_ALIEN))
        });
        h.run();

        let (first, disabled, second, still_disabled) = out.take().unwrap();
        assert_eq!(first, SyscallExit::Restart);
        assert!(disabled);
        assert_eq!(second, SyscallExit::Return(MsgDope::from_error(IpcError::SendTimeout)));
        assert!(!still_disabled);
        assert_eq!(report.take().unwrap().msg[0], TRAP_SYSCALL);
    }

    #[test]
    fn test_syscall_entry_clears_stale_cancel() {
        let h = Harness::new();
        let t = h.thread(1, 0, 10);
        let out = h.spawn(&t, |k, me| {
            me.state_add(ThreadState::CANCEL);
            *me.regs().lock() = IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::ZERO);
            syscall_entry(k, me)
        });
        h.run();
        assert_eq!(
            out.take().unwrap(),
            SyscallExit::Return(MsgDope::from_error(IpcError::RecvTimeout))
        );
    }
}
