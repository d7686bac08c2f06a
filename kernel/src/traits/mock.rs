//! Deterministic uniprocessor for tests
//!
//! Each kernel thread spawned through [`Harness::spawn`] gets a host thread,
//! but only the thread the mock scheduler marked as running executes; every
//! other host thread waits on a condition variable. Scheduling is strict
//! priority, FIFO among equals, with no preemption outside explicit
//! `schedule`/`switch_exec_locked` calls. Time only advances when nothing is
//! ready and an armed timeout is fired.
//!
//! Kernel code that may block must run inside a spawned body; calling it
//! from the test thread itself would wait forever.

use super::{MappingOps, PageFault, SchedulerOps, SwitchMode, TimerOps};
use crate::config::IpcConfig;
use crate::ipc::{
    DopeFlags, Fpage, IpcError, IpcFrame, Mword, MsgDope, RcvDesc, SndDesc, Timeout, PAGE_MASK,
    PAGE_SIZE, WORD_SIZE,
};
use crate::sched::{SpaceId, Thread, ThreadId, ThreadState};
use crate::time::IpcTimeout;
use crate::Kernel;
use std::any::Any;
use std::boxed::Box;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::vec::Vec;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Inner {
    running: Option<ThreadId>,
    ready: Vec<Arc<Thread>>,
    /// Threads with a live host thread, in spawn order
    runnable: Vec<Arc<Thread>>,
    /// owner -> thread that donated its time to it
    helpers: HashMap<ThreadId, Arc<Thread>>,
    armed: Vec<Arc<IpcTimeout>>,
    now: u64,
    switches: u64,
    idle: bool,
    panic: Option<Box<dyn Any + Send>>,
}

impl Inner {
    fn is_runnable(&self, id: ThreadId) -> bool {
        self.runnable.iter().any(|t| t.id() == id)
    }

    fn push_front(&mut self, t: &Arc<Thread>) {
        self.ready.retain(|r| r.id() != t.id());
        self.ready.insert(0, t.clone());
    }

    fn pick_next(&mut self) -> Option<Arc<Thread>> {
        loop {
            let runnable: Vec<ThreadId> = self.runnable.iter().map(|t| t.id()).collect();
            self.ready
                .retain(|t| t.state().contains(ThreadState::READY) && runnable.contains(&t.id()));
            let missing: Vec<Arc<Thread>> = self
                .runnable
                .iter()
                .filter(|t| t.state().contains(ThreadState::READY))
                .filter(|t| !self.ready.iter().any(|r| r.id() == t.id()))
                .cloned()
                .collect();
            self.ready.extend(missing);

            let mut best: Option<usize> = None;
            for (i, t) in self.ready.iter().enumerate() {
                if best.map_or(true, |b| t.prio() > self.ready[b].prio()) {
                    best = Some(i);
                }
            }
            if let Some(i) = best {
                return Some(self.ready.remove(i));
            }

            // idle: fire the earliest timeout
            let earliest = self
                .armed
                .iter()
                .enumerate()
                .min_by_key(|(_, to)| to.deadline())
                .map(|(i, _)| i)?;
            let to = self.armed.remove(earliest);
            self.now = self.now.max(to.deadline());
            to.expire();
        }
    }
}

/// Mock scheduler and timer
pub struct Uniprocessor {
    inner: Mutex<Inner>,
    turn: Condvar,
}

impl Default for Uniprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Uniprocessor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            turn: Condvar::new(),
        }
    }

    fn hand_over(&self, g: &mut Inner, next: Option<Arc<Thread>>) {
        match next {
            Some(t) => {
                if g.running != Some(t.id()) {
                    g.switches += 1;
                }
                g.running = Some(t.id());
                g.idle = false;
            }
            None => {
                g.running = None;
                g.idle = true;
            }
        }
        self.turn.notify_all();
    }

    fn wait_turn<'a>(&'a self, mut g: MutexGuard<'a, Inner>, me: ThreadId) {
        while g.running != Some(me) {
            g = self.turn.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn register(&self, t: &Arc<Thread>) {
        let mut g = lock(&self.inner);
        if !g.is_runnable(t.id()) {
            g.runnable.push(t.clone());
        }
    }

    fn exit(&self, t: &Arc<Thread>, panic: Option<Box<dyn Any + Send>>) {
        let mut g = lock(&self.inner);
        g.runnable.retain(|r| r.id() != t.id());
        g.ready.retain(|r| r.id() != t.id());
        g.helpers.retain(|owner, helper| *owner != t.id() && helper.id() != t.id());
        if panic.is_some() && g.panic.is_none() {
            g.panic = panic;
        }
        if g.running == Some(t.id()) {
            let next = g.pick_next();
            self.hand_over(&mut g, next);
        }
    }

    /// Run spawned threads until none can make progress
    pub fn run(&self) {
        let mut g = lock(&self.inner);
        if g.running.is_none() {
            let next = g.pick_next();
            self.hand_over(&mut g, next);
        }
        while !g.idle {
            g = self.turn.wait(g).unwrap_or_else(PoisonError::into_inner);
        }
        if let Some(p) = g.panic.take() {
            drop(g);
            panic::resume_unwind(p);
        }
    }

    /// Number of context switches so far
    pub fn switches(&self) -> u64 {
        lock(&self.inner).switches
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.inner).armed.len()
    }
}

impl SchedulerOps for Uniprocessor {
    fn schedule(&self, cur: &Arc<Thread>) {
        let mut g = lock(&self.inner);
        if cur.state().contains(ThreadState::READY) {
            g.push_front(cur);
        }
        let next = g.pick_next();
        if next.as_ref().map(|t| t.id()) == Some(cur.id()) {
            return;
        }
        self.hand_over(&mut g, next);
        self.wait_turn(g, cur.id());
    }

    fn switch_exec_locked(&self, cur: &Arc<Thread>, target: &Arc<Thread>, mode: SwitchMode) {
        let mut g = lock(&self.inner);
        match mode {
            SwitchMode::Helping => {
                g.helpers.insert(target.id(), cur.clone());
            }
            SwitchMode::NotHelping => {
                g.helpers.remove(&target.id());
            }
            SwitchMode::IgnoreHelping => {
                if g.helpers.get(&cur.id()).map(|h| h.id()) == Some(target.id()) {
                    g.helpers.remove(&cur.id());
                }
            }
        }

        if target.id() == cur.id()
            || !g.is_runnable(target.id())
            || !target.state().contains(ThreadState::READY)
        {
            drop(g);
            self.schedule(cur);
            return;
        }

        if cur.state().contains(ThreadState::READY) {
            g.push_front(cur);
        }
        g.ready.retain(|r| r.id() != target.id());
        self.hand_over(&mut g, Some(target.clone()));
        self.wait_turn(g, cur.id());
    }

    fn ready_enqueue(&self, thread: &Arc<Thread>) {
        let mut g = lock(&self.inner);
        if !g.ready.iter().any(|r| r.id() == thread.id()) {
            g.ready.push(thread.clone());
        }
    }

    fn ready_dequeue(&self, thread: &Arc<Thread>) {
        lock(&self.inner).ready.retain(|r| r.id() != thread.id());
    }

    fn helper(&self, owner: &Arc<Thread>) -> Option<Arc<Thread>> {
        lock(&self.inner).helpers.get(&owner.id()).cloned()
    }
}

impl TimerOps for Uniprocessor {
    fn now(&self) -> u64 {
        lock(&self.inner).now
    }

    fn arm(&self, timeout: &Arc<IpcTimeout>) {
        let mut g = lock(&self.inner);
        if !g.armed.iter().any(|a| Arc::ptr_eq(a, timeout)) {
            g.armed.push(timeout.clone());
        }
    }

    fn disarm(&self, timeout: &IpcTimeout) {
        lock(&self.inner)
            .armed
            .retain(|a| !core::ptr::eq(Arc::as_ptr(a), timeout));
    }
}

const PAGE_WORDS: usize = PAGE_SIZE / WORD_SIZE;

type Page = Arc<Mutex<[Mword; PAGE_WORDS]>>;

/// Mock address spaces: pages are shared buffers, mapping shares them
#[derive(Default)]
pub struct MockSpaces {
    pages: Mutex<HashMap<(SpaceId, Mword), Page>>,
    refuse: AtomicBool,
    maps: AtomicUsize,
}

impl MockSpaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back the page containing `addr` with fresh zeroed memory
    pub fn add_page(&self, space: SpaceId, addr: Mword) {
        lock(&self.pages)
            .entry((space, addr & PAGE_MASK))
            .or_insert_with(|| Arc::new(Mutex::new([0; PAGE_WORDS])));
    }

    pub fn is_mapped(&self, space: SpaceId, addr: Mword) -> bool {
        lock(&self.pages).contains_key(&(space, addr & PAGE_MASK))
    }

    /// Whether two spaces see the same memory at these addresses
    pub fn shares(&self, a: SpaceId, a_addr: Mword, b: SpaceId, b_addr: Mword) -> bool {
        let pages = lock(&self.pages);
        match (pages.get(&(a, a_addr & PAGE_MASK)), pages.get(&(b, b_addr & PAGE_MASK))) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    pub fn poke(&self, space: SpaceId, addr: Mword, val: Mword) {
        self.write_word(space, addr, val)
            .expect("poke into an unmapped page");
    }

    pub fn peek(&self, space: SpaceId, addr: Mword) -> Mword {
        self.read_word(space, addr)
            .expect("peek into an unmapped page")
    }

    /// Make every subsequent `fpage_map` fail
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn map_calls(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    fn page(&self, space: SpaceId, addr: Mword) -> Option<Page> {
        lock(&self.pages).get(&(space, addr & PAGE_MASK)).cloned()
    }
}

fn size_mask(log2: u32) -> Mword {
    if log2 >= Mword::BITS {
        !0
    } else {
        (1 << log2) - 1
    }
}

impl MappingOps for MockSpaces {
    fn fpage_map(&self, src: SpaceId, fpage: Fpage, dst: SpaceId, window: Fpage, offset: Mword) -> MsgDope {
        self.maps.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return MsgDope::from_error(IpcError::RecvMapFailed);
        }

        let fp_mask = size_mask(fpage.size_log2());
        let src_base = fpage.base() & !fp_mask;
        let dst_base = window.base().wrapping_add(offset & size_mask(window.size_log2()) & !fp_mask);

        let mut pages = lock(&self.pages);
        let sources: Vec<(Mword, Page)> = pages
            .iter()
            .filter(|((space, addr), _)| *space == src && addr.wrapping_sub(src_base) <= fp_mask)
            .map(|((_, addr), page)| (*addr, page.clone()))
            .collect();
        if sources.is_empty() {
            return MsgDope::from_error(IpcError::RecvMapFailed);
        }
        for (addr, page) in sources {
            pages.insert((dst, dst_base.wrapping_add(addr - src_base)), page);
        }
        MsgDope::default().with_flags(DopeFlags::FPAGE_RECEIVED)
    }

    fn read_word(&self, space: SpaceId, addr: Mword) -> Result<Mword, PageFault> {
        match self.page(space, addr) {
            Some(page) => Ok(lock(&page)[(addr & !PAGE_MASK) / WORD_SIZE]),
            None => Err(PageFault { addr, write: false }),
        }
    }

    fn write_word(&self, space: SpaceId, addr: Mword, val: Mword) -> Result<(), PageFault> {
        match self.page(space, addr) {
            Some(page) => {
                lock(&page)[(addr & !PAGE_MASK) / WORD_SIZE] = val;
                Ok(())
            }
            None => Err(PageFault { addr, write: true }),
        }
    }
}

/// Result slot of a spawned body
pub struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T> Slot<T> {
    pub fn take(&self) -> Option<T> {
        lock(&self.0).take()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_none()
    }
}

/// A kernel wired to the mock scheduler, timer and address spaces
pub struct Harness {
    pub kernel: Arc<Kernel>,
    pub up: Arc<Uniprocessor>,
    pub spaces: Arc<MockSpaces>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(IpcConfig::default())
    }

    pub fn with_config(config: IpcConfig) -> Self {
        let up = Arc::new(Uniprocessor::new());
        let spaces = Arc::new(MockSpaces::new());
        let kernel = Arc::new(Kernel::new(config, up.clone(), up.clone(), spaces.clone()));
        Self { kernel, up, spaces }
    }

    /// Create a ready thread in task `task`'s address space
    pub fn thread(&self, task: u32, lthread: u32, prio: u8) -> Arc<Thread> {
        self.kernel.create_thread(ThreadId::new(task, lthread), prio)
    }

    /// Give `thread` a body. It runs once the scheduler picks the thread.
    pub fn spawn<T, F>(&self, thread: &Arc<Thread>, body: F) -> Slot<T>
    where
        T: Send + 'static,
        F: FnOnce(&Kernel, &Arc<Thread>) -> T + Send + 'static,
    {
        let slot = Slot(Arc::new(Mutex::new(None)));
        let out = slot.0.clone();
        let (up, kernel, t) = (self.up.clone(), self.kernel.clone(), thread.clone());
        up.register(&t);
        std::thread::spawn(move || {
            up.wait_turn(lock(&up.inner), t.id());
            let res = panic::catch_unwind(AssertUnwindSafe(|| body(&kernel, &t)));
            match res {
                Ok(v) => {
                    *lock(&out) = Some(v);
                    up.exit(&t, None);
                }
                Err(p) => up.exit(&t, Some(p)),
            }
        });
        slot
    }

    /// Run until every spawned thread finished or blocked for good.
    /// Re-raises the first panic of a body.
    pub fn run(&self) {
        self.up.run();
    }

    pub fn now(&self) -> u64 {
        self.up.now()
    }

    pub fn switches(&self) -> u64 {
        self.up.switches()
    }

    pub fn armed_count(&self) -> usize {
        self.up.armed_count()
    }
}

/// Issue an IPC system call with `frame` and return the resulting frame
pub fn ipc(k: &Kernel, me: &Arc<Thread>, frame: IpcFrame) -> IpcFrame {
    *me.regs().lock() = frame;
    crate::syscall::sys_ipc(k, me);
    *me.regs().lock()
}

/// Like [`ipc`], through the trap entry (shortcut first)
pub fn entry(k: &Kernel, me: &Arc<Thread>, frame: IpcFrame) -> IpcFrame {
    *me.regs().lock() = frame;
    crate::trap::syscall_entry(k, me);
    *me.regs().lock()
}

/// Serve page faults forever: each fault gets a fresh page of our own,
/// starting at `first_page`, mapped to the faulting address
pub fn pager_loop(k: &Kernel, me: &Arc<Thread>, spaces: &MockSpaces, first_page: Mword) {
    let mut next = first_page;
    let mut frame = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::NEVER));
    loop {
        if frame.dope.has_error() {
            frame = ipc(k, me, IpcFrame::receive(ThreadId::NIL, RcvDesc::OPEN, Timeout::NEVER));
            continue;
        }
        let fault = frame.msg[0];
        spaces.add_page(me.space(), next);
        let reply = IpcFrame {
            snd_desc: SndDesc::MAP,
            rcv_desc: RcvDesc::OPEN,
            timeout: Timeout::NEVER,
            dest: frame.src,
            msg: [fault & PAGE_MASK, Fpage::new(next, 12, true, false).0, 0],
            ..IpcFrame::default()
        };
        next += PAGE_SIZE;
        frame = ipc(k, me, reply);
    }
}
