//! Thread management
//!
//! A [`Thread`] is the unit of scheduling and IPC. Its state word and lock
//! count are atomics touched by partners; everything a partner may read or
//! write during a handshake sits in [`IpcState`] behind a spin lock that is
//! never held across a context switch.

use super::state::{StateWord, ThreadState};
use super::switch_lock::{LockResult, ThreadLock};
use crate::ipc::{
    shared_frame, sender_dequeue, IpcError, IpcFrame, Mword, Partner, PfErr, RcvDesc, Sender,
    SharedFrame, Timeout,
};
use crate::sync::{CpuGuard, TableLock};
use crate::time::IpcTimeout;
use crate::traits::SwitchMode;
use crate::Kernel;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

/// Thread identifier: task number in the high half, thread number in the
/// low half
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The nil id
    pub const NIL: Self = Self(0);
    /// The invalid id
    pub const INVALID: Self = Self(!0);

    pub const fn new(task: u32, lthread: u32) -> Self {
        Self(((task as u64) << 32) | lthread as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Id under which interrupt `irq` sends
    pub const fn irq(irq: u32) -> Self {
        Self::new(0, irq + 1)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn task(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn lthread(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    pub const fn is_invalid(self) -> bool {
        self.0 == !0
    }

    /// Whether this id names an interrupt rather than a thread
    pub const fn is_irq(self) -> bool {
        self.task() == 0 && self.lthread() != 0
    }

    /// Interrupt number of an interrupt id
    pub const fn irq_number(self) -> u32 {
        self.lthread().wrapping_sub(1)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else if self.is_invalid() {
            f.write_str("invalid")
        } else if self.is_irq() {
            write!(f, "irq{}", self.irq_number())
        } else {
            write!(f, "{:x}.{:x}", self.task(), self.lthread())
        }
    }
}

/// Address space identifier (the task number)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpaceId(pub u32);

/// Page-in request left by a long-IPC sender for the receiver to service
pub(crate) struct PageinRequest {
    pub addr: Mword,
    pub err: PfErr,
    pub applicant: Arc<Thread>,
}

/// IPC fields shared with partners
pub(crate) struct IpcState {
    /// Whom we receive from, or the sender of the ongoing transfer
    pub partner: Partner,
    /// Frame incoming messages are written to
    pub rcv_regs: Option<SharedFrame>,
    /// Thread we are sending to
    pub receiver: Option<ThreadId>,
    /// Senders waiting for us to receive
    pub senders: VecDeque<Arc<dyn Sender>>,
    /// Timeout of the wait we are in
    pub timeout: Option<Arc<IpcTimeout>>,
    /// Timeout for page-fault IPC during a long transfer
    pub pf_timeout: Timeout,
    /// Receiver's descriptor for the long transfer we are sending
    pub target_desc: RcvDesc,
    pub pagein: Option<PageinRequest>,
    /// Result of servicing our last page-in request
    pub continue_code: Option<Result<(), IpcError>>,
    pub pager: Option<ThreadId>,
    pub exception_handler: Option<Mword>,
}

impl Default for IpcState {
    fn default() -> Self {
        Self {
            partner: Partner::Open,
            rcv_regs: None,
            receiver: None,
            senders: VecDeque::new(),
            timeout: None,
            pf_timeout: Timeout::NEVER,
            target_desc: RcvDesc::NONE,
            pagein: None,
            continue_code: None,
            pager: None,
            exception_handler: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct UserRegs {
    ip: Mword,
    sp: Mword,
}

/// Thread control block
pub struct Thread {
    id: ThreadId,
    space: SpaceId,
    prio: u8,
    state: StateWord,
    /// Switch locks held by this thread
    lock_cnt: AtomicU32,
    /// Raw id of a thread waiting for `lock_cnt` to drop to zero
    donatee: AtomicU64,
    thread_lock: ThreadLock,
    in_sender_list: AtomicBool,
    irq_count: AtomicU32,
    regs: SharedFrame,
    user: Mutex<UserRegs>,
    ipc: Mutex<IpcState>,
    self_ref: Weak<Thread>,
}

impl Thread {
    /// New ready thread
    pub fn new(id: ThreadId, prio: u8) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            space: SpaceId(id.task()),
            prio,
            state: StateWord::new(ThreadState::READY),
            lock_cnt: AtomicU32::new(0),
            donatee: AtomicU64::new(0),
            thread_lock: ThreadLock::new(me.clone()),
            in_sender_list: AtomicBool::new(false),
            irq_count: AtomicU32::new(0),
            regs: shared_frame(IpcFrame::default()),
            user: Mutex::new(UserRegs::default()),
            ipc: Mutex::new(IpcState::default()),
            self_ref: me.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn space(&self) -> SpaceId {
        self.space
    }

    #[inline]
    pub fn prio(&self) -> u8 {
        self.prio
    }

    /// Strong reference to ourselves; `None` only during teardown
    pub fn arc(&self) -> Option<Arc<Thread>> {
        self.self_ref.upgrade()
    }

    pub fn weak(&self) -> Weak<Thread> {
        self.self_ref.clone()
    }

    // State word

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.set(state);
    }

    pub fn state_change(&self, del: ThreadState, add: ThreadState) -> ThreadState {
        self.state.change(del, add)
    }

    pub fn state_change_safely(&self, del: ThreadState, add: ThreadState) -> bool {
        self.state.change_safely(del, add)
    }

    pub fn state_add(&self, bits: ThreadState) -> ThreadState {
        self.state.add(bits)
    }

    pub fn state_del(&self, bits: ThreadState) -> ThreadState {
        self.state.del(bits)
    }

    pub fn state_change_dirty(&self, guard: &CpuGuard<'_>, del: ThreadState, add: ThreadState) {
        self.state.change_dirty(guard, del, add);
    }

    pub fn state_add_dirty(&self, guard: &CpuGuard<'_>, bits: ThreadState) {
        self.state.add_dirty(guard, bits);
    }

    pub fn state_del_dirty(&self, guard: &CpuGuard<'_>, bits: ThreadState) {
        self.state.del_dirty(guard, bits);
    }

    // Locking

    pub fn thread_lock(&self) -> &ThreadLock {
        &self.thread_lock
    }

    pub fn lock_cnt(&self) -> u32 {
        self.lock_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn inc_lock_cnt(&self) {
        self.lock_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_lock_cnt(&self) {
        let old = self.lock_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "lock count underflow on {:?}", self.id);
    }

    pub fn donatee(&self) -> Option<ThreadId> {
        match self.donatee.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    pub fn set_donatee(&self, donatee: Option<ThreadId>) {
        self.donatee
            .store(donatee.map_or(0, ThreadId::raw), Ordering::Release);
    }

    // Registers

    /// The register frame system calls operate on
    pub fn regs(&self) -> &SharedFrame {
        &self.regs
    }

    pub fn user_ip(&self) -> Mword {
        self.user.lock().ip
    }

    pub fn set_user_ip(&self, ip: Mword) {
        self.user.lock().ip = ip;
    }

    pub fn user_sp(&self) -> Mword {
        self.user.lock().sp
    }

    pub fn set_user_sp(&self, sp: Mword) {
        self.user.lock().sp = sp;
    }

    // IPC fields

    pub(crate) fn ipc(&self) -> MutexGuard<'_, IpcState> {
        self.ipc.lock()
    }

    pub fn partner(&self) -> Partner {
        self.ipc().partner.clone()
    }

    pub fn rcv_regs(&self) -> Option<SharedFrame> {
        self.ipc().rcv_regs.clone()
    }

    pub fn receiver(&self) -> Option<ThreadId> {
        self.ipc().receiver
    }

    pub fn set_receiver(&self, receiver: Option<ThreadId>) {
        self.ipc().receiver = receiver;
    }

    pub fn pager(&self) -> Option<ThreadId> {
        self.ipc().pager
    }

    pub fn set_pager(&self, pager: Option<ThreadId>) {
        self.ipc().pager = pager;
    }

    /// User-level exception handler entry, if registered
    pub fn exception_handler(&self) -> Option<Mword> {
        self.ipc().exception_handler
    }

    pub fn set_exception_handler(&self, pc: Option<Mword>) {
        self.ipc().exception_handler = pc;
    }

    /// Number of senders queued on us
    pub fn sender_count(&self) -> usize {
        self.ipc().senders.len()
    }

    pub(crate) fn set_in_sender_list_flag(&self, queued: bool) {
        self.in_sender_list.store(queued, Ordering::Release);
    }

    pub(crate) fn in_sender_list_flag(&self) -> bool {
        self.in_sender_list.load(Ordering::Acquire)
    }

    // Timeouts

    pub fn timeout(&self) -> Option<Arc<IpcTimeout>> {
        self.ipc().timeout.clone()
    }

    pub fn set_timeout(&self, timeout: Option<Arc<IpcTimeout>>) {
        self.ipc().timeout = timeout;
    }

    /// Disarm the timeout of the wait we are in, if any
    pub fn reset_timeout(&self, k: &Kernel) {
        if let Some(to) = self.timeout() {
            to.reset(&*k.timer);
        }
    }

    /// Arm a fresh timeout for the wait we are about to enter
    pub(crate) fn arm_timeout(&self, k: &Kernel, micros: u64) -> Arc<IpcTimeout> {
        let to = IpcTimeout::new(self.weak());
        to.set(&*k.timer, k.timer.now().saturating_add(micros));
        self.set_timeout(Some(to.clone()));
        to
    }

    // Interrupts

    pub fn irq_count(&self) -> u32 {
        self.irq_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_irq_count(&self) {
        self.irq_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_irq_count(&self) {
        let _ = self
            .irq_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("prio", &self.prio)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Registry of all threads, keyed by id
pub struct ThreadTable {
    threads: TableLock<HashMap<ThreadId, Arc<Thread>>>,
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            threads: TableLock::new(HashMap::new(), "threads"),
        }
    }

    /// Create a ready thread, replacing any previous thread with that id
    pub fn create(&self, id: ThreadId, prio: u8) -> Arc<Thread> {
        let thread = Thread::new(id, prio);
        self.threads.write().insert(id, thread.clone());
        log::trace!("created thread {:?} prio {}", id, prio);
        thread
    }

    pub fn lookup(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Values replaced by [`ex_regs`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExRegsOld {
    pub ip: Mword,
    pub sp: Mword,
    pub pager: Option<ThreadId>,
}

/// Parameters of [`ex_regs`]; `None` leaves a value unchanged
#[derive(Clone, Copy, Debug, Default)]
pub struct ExRegs {
    pub ip: Option<Mword>,
    pub sp: Option<Mword>,
    pub pager: Option<ThreadId>,
    /// Report exceptions and system calls to the pager
    pub alien: bool,
}

/// Re-initialize `target`.
///
/// A dead thread comes back to life; a live one has its IPC canceled. The
/// target sees the cancel at its next check point.
pub fn ex_regs(
    k: &Kernel,
    cur: &Arc<Thread>,
    target: &Arc<Thread>,
    regs: ExRegs,
) -> Result<ExRegsOld, IpcError> {
    let locked = target.thread_lock().lock(k, cur);
    if locked == LockResult::Invalid {
        return Err(IpcError::NotExistent);
    }

    let old = ExRegsOld {
        ip: target.user_ip(),
        sp: target.user_sp(),
        pager: target.pager(),
    };

    if target.state().contains(ThreadState::DEAD) {
        target.state_change(ThreadState::DEAD, ThreadState::READY);
    } else {
        target.state_change(
            ThreadState::IPC_IN_PROGRESS,
            ThreadState::CANCEL | ThreadState::READY,
        );
    }
    if target.id() != cur.id() {
        k.sched.ready_enqueue(target);
    }

    if let Some(ip) = regs.ip {
        target.set_user_ip(ip);
        if regs.alien {
            target.state_change(ThreadState::DIS_ALIEN, ThreadState::ALIEN);
        } else {
            target.state_del(ThreadState::ALIEN | ThreadState::DIS_ALIEN);
        }
    }
    if let Some(sp) = regs.sp {
        target.set_user_sp(sp);
    }
    if regs.pager.is_some() {
        target.set_pager(regs.pager);
    }

    log::debug!("ex_regs {:?} by {:?}: now {:?}", target.id(), cur.id(), target.state());

    if locked == LockResult::Acquired {
        target.thread_lock().clear(k, cur);
    }
    Ok(old)
}

/// Destroy `victim`'s IPC presence and mark it dead.
///
/// Returns `false` if the thread was already killed.
pub fn kill(k: &Kernel, cur: &Arc<Thread>, victim: &Arc<Thread>) -> bool {
    if victim.id() == cur.id() {
        return false;
    }
    if victim.thread_lock().lock(k, cur) == LockResult::Invalid {
        return false;
    }

    // wait until the victim has released every lock it holds
    if victim.lock_cnt() > 0 {
        victim.set_donatee(Some(cur.id()));
        while victim.lock_cnt() > 0 {
            k.sched.switch_exec_locked(cur, victim, SwitchMode::Helping);
        }
        victim.set_donatee(None);
    }

    let long_partner = {
        let ipc = victim.ipc();
        match &ipc.partner {
            Partner::Sender(s) if victim.state().contains(ThreadState::RCVLONG_IN_PROGRESS) => {
                Some(s.clone())
            }
            _ => None,
        }
    };

    victim.set_state(ThreadState::DEAD);
    k.irqs.free_all(victim);
    victim.reset_timeout(k);
    victim.set_timeout(None);

    let senders: Vec<Arc<dyn Sender>> = victim.ipc().senders.drain(..).collect();
    for sender in senders {
        sender.set_in_sender_list(false);
        sender.ipc_receiver_aborted(k);
    }
    if let Some(partner) = long_partner {
        partner.ipc_receiver_aborted(k);
    }

    if victim.in_sender_list_flag() {
        if let Some(receiver) = victim.receiver().and_then(|id| k.lookup(id)) {
            sender_dequeue(&receiver, victim.as_ref());
        }
    }

    k.sched.ready_dequeue(victim);
    victim.thread_lock().clear_and_invalidate(k, cur);
    log::debug!("killed {:?}", victim.id());
    true
}

/// Park the current thread until someone re-initializes it with [`ex_regs`]
pub fn halt(k: &Kernel, cur: &Arc<Thread>) {
    cur.state_del(ThreadState::CANCEL);
    if cur.state_change_safely(ThreadState::READY, ThreadState::CANCEL | ThreadState::DEAD) {
        while !cur.state().contains(ThreadState::READY) {
            k.sched.schedule(cur);
        }
    }
}
