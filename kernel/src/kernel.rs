//! The kernel context passed to every IPC operation

use crate::config::IpcConfig;
use crate::driver::irq::IrqTable;
use crate::sched::{Thread, ThreadId, ThreadTable};
use crate::sync::CpuLock;
use crate::trace::TraceBuffer;
use crate::traits::{MappingOps, SchedulerOps, TimerOps};
use alloc::sync::Arc;

/// Registries, services and tunables of one kernel instance
pub struct Kernel {
    pub config: IpcConfig,
    pub threads: ThreadTable,
    pub irqs: IrqTable,
    pub sched: Arc<dyn SchedulerOps>,
    pub timer: Arc<dyn TimerOps>,
    pub mapper: Arc<dyn MappingOps>,
    pub cpu_lock: CpuLock,
    pub trace: TraceBuffer,
}

impl Kernel {
    pub fn new(
        config: IpcConfig,
        sched: Arc<dyn SchedulerOps>,
        timer: Arc<dyn TimerOps>,
        mapper: Arc<dyn MappingOps>,
    ) -> Self {
        log::info!(
            "IPC core {}: shortcut={} switch_on_ipc={} deceit_disables_switch={} multi_irq_attach={}",
            crate::VERSION,
            config.shortcut,
            config.switch_on_ipc,
            config.deceit_bit_disables_switch,
            config.multi_irq_attach
        );
        Self {
            config,
            threads: ThreadTable::new(),
            irqs: IrqTable::new(),
            sched,
            timer,
            mapper,
            cpu_lock: CpuLock::new(),
            trace: TraceBuffer::new(),
        }
    }

    /// Look up a thread by id
    #[inline]
    pub fn lookup(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lookup(id)
    }

    pub fn create_thread(&self, id: ThreadId, prio: u8) -> Arc<Thread> {
        self.threads.create(id, prio)
    }

    /// Current time in microseconds
    pub fn now(&self) -> u64 {
        self.timer.now()
    }
}
