//! Interrupts as IPC senders
//!
//! A user-level driver associates itself with an interrupt by receiving
//! from the interrupt's id with a zero timeout. From then on every hit is
//! delivered as an empty message whose source is the interrupt id. Hits
//! that arrive while the owner is busy are counted, and the interrupt waits
//! in the owner's sender queue like any other sender.

use crate::ipc::{
    sender_dequeue, sender_enqueue, wake_receiver, MsgDope, Sender, NUM_REG_WORDS,
};
use crate::sched::{LockResult, Thread, ThreadId};
use crate::Kernel;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

/// Number of interrupt lines
pub const MAX_IRQS: usize = 32;

/// One interrupt line
pub struct Irq {
    number: u32,
    owner: Mutex<Weak<Thread>>,
    /// Hits not yet delivered
    pending: AtomicU32,
    /// Acknowledged by the kernel on delivery rather than by the owner
    ack_in_kernel: AtomicBool,
    /// Delivered, waiting for the owner's acknowledgement
    masked: AtomicBool,
    in_sender_list: AtomicBool,
    self_ref: Weak<Irq>,
}

impl Irq {
    fn new(number: u32) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            number,
            owner: Mutex::new(Weak::new()),
            pending: AtomicU32::new(0),
            ack_in_kernel: AtomicBool::new(true),
            masked: AtomicBool::new(false),
            in_sender_list: AtomicBool::new(false),
            self_ref: me.clone(),
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// The interrupt's IPC id
    pub fn id(&self) -> ThreadId {
        ThreadId::irq(self.number)
    }

    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.owner.lock().upgrade()
    }

    pub fn is_owned_by(&self, thread: &Thread) -> bool {
        self.owner().is_some_and(|o| o.id() == thread.id())
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::Acquire)
    }

    /// The interrupt fired; `cur` is the thread it interrupted.
    ///
    /// Delivers right away if the owner waits for us, queues otherwise.
    pub fn hit(self: &Arc<Self>, k: &Kernel, cur: &Arc<Thread>) {
        let Some(owner) = self.owner() else {
            log::trace!("irq {}: no owner, dropped", self.number);
            return;
        };
        let old = self.pending.fetch_add(1, Ordering::AcqRel);
        if old == 0 && !self.is_masked() {
            self.deliver_or_queue(k, cur, &owner);
        }
    }

    fn deliver_or_queue(self: &Arc<Self>, k: &Kernel, cur: &Arc<Thread>, owner: &Arc<Thread>) {
        if owner.sender_ok(self.id()) {
            self.ipc_receiver_ready(k, cur);
        } else {
            sender_enqueue(owner, self.clone());
        }
    }

    /// Unmask after a delivery; a hit that came in meanwhile is delivered
    pub fn acknowledge(self: &Arc<Self>, k: &Kernel, cur: &Arc<Thread>) {
        if !self.masked.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.pending() > 0 {
            if let Some(owner) = self.owner() {
                self.deliver_or_queue(k, cur, &owner);
            }
        }
    }

    fn detach(&self, owner: &Thread) {
        *self.owner.lock() = Weak::new();
        self.pending.store(0, Ordering::Release);
        self.masked.store(false, Ordering::Release);
        owner.dec_irq_count();
        if self.in_sender_list() {
            sender_dequeue(owner, self);
        }
    }
}

impl Sender for Irq {
    fn sender_id(&self) -> ThreadId {
        self.id()
    }

    fn receiver_id(&self) -> Option<ThreadId> {
        self.owner().map(|o| o.id())
    }

    fn in_sender_list(&self) -> bool {
        self.in_sender_list.load(Ordering::Acquire)
    }

    fn set_in_sender_list(&self, queued: bool) {
        self.in_sender_list.store(queued, Ordering::Release);
    }

    fn ipc_receiver_ready(&self, k: &Kernel, cur: &Arc<Thread>) {
        let Some(owner) = self.owner() else {
            return;
        };
        let locked = owner.thread_lock().lock(k, cur);
        if locked == LockResult::Invalid {
            return;
        }

        if owner.sender_ok(self.id()) {
            if let Some(regs) = owner.rcv_regs() {
                let mut f = regs.lock();
                f.msg = [0; NUM_REG_WORDS];
                f.src = self.id();
                f.dope = MsgDope::default();
            }
            sender_dequeue(&owner, self);
            if !self.ack_in_kernel.load(Ordering::Acquire) {
                self.masked.store(true, Ordering::Release);
            }
            let left = self.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
            wake_receiver(k, &owner);
            log::trace!("irq {} delivered to {:?}", self.number, owner.id());

            if left > 0 && !self.is_masked() {
                if let Some(me) = self.self_ref.upgrade() {
                    sender_enqueue(&owner, me);
                }
            }
        }

        if locked == LockResult::Acquired {
            owner.thread_lock().clear(k, cur);
        }
    }

    fn ipc_receiver_aborted(&self, _k: &Kernel) {
        *self.owner.lock() = Weak::new();
        self.pending.store(0, Ordering::Release);
        self.masked.store(false, Ordering::Release);
    }
}

/// All interrupt lines of the machine
pub struct IrqTable {
    irqs: Vec<Arc<Irq>>,
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqTable {
    pub fn new() -> Self {
        Self {
            irqs: (0..MAX_IRQS as u32).map(Irq::new).collect(),
        }
    }

    pub fn get(&self, number: u32) -> Option<Arc<Irq>> {
        self.irqs.get(number as usize).cloned()
    }

    /// Interrupt behind an interrupt thread id
    pub fn lookup(&self, id: ThreadId) -> Option<Arc<Irq>> {
        if !id.is_irq() {
            return None;
        }
        self.get(id.irq_number())
    }

    /// Associate `irq` with `thread`.
    ///
    /// Fails if another thread owns it; re-associating with the current
    /// owner succeeds and only updates the acknowledge mode.
    pub fn alloc(&self, irq: &Irq, thread: &Arc<Thread>, ack_in_kernel: bool) -> bool {
        let mut owner = irq.owner.lock();
        match owner.upgrade() {
            Some(o) if o.id() != thread.id() => return false,
            Some(_) => {}
            None => {
                *owner = Arc::downgrade(thread);
                thread.inc_irq_count();
                log::debug!("irq {} attached to {:?}", irq.number, thread.id());
            }
        }
        irq.ack_in_kernel.store(ack_in_kernel, Ordering::Release);
        true
    }

    /// Detach `irq` from `thread`; `false` if `thread` does not own it
    pub fn free(&self, irq: &Irq, thread: &Thread) -> bool {
        if !irq.is_owned_by(thread) {
            return false;
        }
        irq.detach(thread);
        log::debug!("irq {} detached from {:?}", irq.number, thread.id());
        true
    }

    /// Detach every interrupt `thread` owns
    pub fn free_all(&self, thread: &Thread) {
        for irq in &self.irqs {
            self.free(irq, thread);
        }
    }

    /// Detach every interrupt `thread` owns except `keep`
    pub fn free_all_except(&self, thread: &Thread, keep: &Irq) {
        for irq in self.irqs.iter().filter(|i| i.number != keep.number) {
            self.free(irq, thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IpcError, IpcFrame, RcvDesc, Timeout};
    use crate::traits::mock::{ipc, Harness};

    #[test]
    fn test_alloc_is_exclusive() {
        let h = Harness::new();
        let a = h.thread(1, 0, 10);
        let b = h.thread(2, 0, 10);
        let irqs = &h.kernel.irqs;
        let irq = irqs.get(3).unwrap();

        assert!(irqs.alloc(&irq, &a, true));
        assert!(irqs.alloc(&irq, &a, false));
        assert_eq!(a.irq_count(), 1);
        assert!(!irqs.alloc(&irq, &b, true));
        assert!(!irqs.free(&irq, &b));

        assert!(irqs.free(&irq, &a));
        assert_eq!(a.irq_count(), 0);
        assert!(irq.owner().is_none());
        assert!(irqs.alloc(&irq, &b, true));
    }

    #[test]
    fn test_lookup_by_id() {
        let h = Harness::new();
        let irqs = &h.kernel.irqs;
        assert_eq!(irqs.lookup(ThreadId::irq(5)).unwrap().number(), 5);
        assert!(irqs.lookup(ThreadId::irq(MAX_IRQS as u32)).is_none());
        assert!(irqs.lookup(ThreadId::new(1, 0)).is_none());
    }

    #[test]
    fn test_associate_then_receive_hit() {
        let h = Harness::new();
        let drv = h.thread(1, 0, 20);
        let hw = h.thread(2, 0, 1);
        let id = ThreadId::irq(4);

        let out = h.spawn(&drv, move |k, me| {
            let attach = ipc(k, me, IpcFrame::receive(id, RcvDesc::SHORT, Timeout::ZERO));
            let hit = ipc(k, me, IpcFrame::receive(id, RcvDesc::SHORT, Timeout::NEVER));
            (attach, hit)
        });
        h.spawn(&hw, |k, me| k.irqs.get(4).unwrap().hit(k, me));
        h.run();

        let (attach, hit) = out.take().unwrap();
        assert_eq!(attach.dope, MsgDope::from_error(IpcError::RecvTimeout));
        assert_eq!(hit.dope, MsgDope::default());
        assert_eq!(hit.src, id);
        assert_eq!(hit.msg, [0; NUM_REG_WORDS]);
        assert!(h.kernel.irqs.get(4).unwrap().is_owned_by(&drv));
        assert_eq!(h.kernel.irqs.get(4).unwrap().pending(), 0);
    }

    #[test]
    fn test_hit_while_busy_is_queued() {
        let h = Harness::new();
        let drv = h.thread(1, 0, 10);
        let hw = h.thread(2, 0, 30);
        let irq = h.kernel.irqs.get(6).unwrap();
        assert!(h.kernel.irqs.alloc(&irq, &drv, true));

        // hits twice before the driver listens
        h.spawn(&hw, |k, me| {
            let irq = k.irqs.get(6).unwrap();
            irq.hit(k, me);
            irq.hit(k, me);
        });
        let out = h.spawn(&drv, |k, me| {
            let first = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::NEVER));
            let second = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::ZERO));
            let third = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::ZERO));
            (first, second, third)
        });
        h.run();

        let (first, second, third) = out.take().unwrap();
        assert_eq!(first.src, ThreadId::irq(6));
        assert_eq!(second.src, ThreadId::irq(6));
        assert!(second.dope.result().is_ok());
        assert_eq!(third.dope.error(), Some(IpcError::RecvTimeout));
        assert_eq!(irq.pending(), 0);
        assert_eq!(drv.sender_count(), 0);
    }

    #[test]
    fn test_user_acknowledged_irq_stays_masked() {
        let h = Harness::new();
        let drv = h.thread(1, 0, 10);
        let hw = h.thread(2, 0, 30);
        let irq = h.kernel.irqs.get(7).unwrap();
        assert!(h.kernel.irqs.alloc(&irq, &drv, false));

        h.spawn(&hw, |k, me| {
            let irq = k.irqs.get(7).unwrap();
            irq.hit(k, me);
            irq.hit(k, me);
        });
        let out = h.spawn(&drv, |k, me| {
            let first = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::NEVER));
            let masked = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::ZERO));
            let irq = k.irqs.get(7).unwrap();
            irq.acknowledge(k, me);
            let second = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::ZERO));
            (first, masked, second)
        });
        h.run();

        let (first, masked, second) = out.take().unwrap();
        assert_eq!(first.src, ThreadId::irq(7));
        assert_eq!(masked.dope.error(), Some(IpcError::RecvTimeout));
        assert_eq!(second.src, ThreadId::irq(7));
        assert!(irq.is_masked());
    }

    #[test]
    fn test_free_dequeues_pending_irq() {
        let h = Harness::new();
        let drv = h.thread(1, 0, 10);
        let hw = h.thread(2, 0, 30);
        let irq = h.kernel.irqs.get(2).unwrap();
        assert!(h.kernel.irqs.alloc(&irq, &drv, true));

        h.spawn(&hw, |k, me| k.irqs.get(2).unwrap().hit(k, me));
        h.run();
        assert_eq!(drv.sender_count(), 1);
        assert_eq!(irq.pending(), 1);

        h.kernel.irqs.free_all(&drv);
        assert_eq!(drv.sender_count(), 0);
        assert_eq!(irq.pending(), 0);
        assert!(!irq.in_sender_list());
    }
}
