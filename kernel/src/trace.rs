//! IPC trace buffer
//!
//! A fixed-size ring of the most recent IPC events, kept for a kernel
//! debugger to inspect, plus running shortcut counters. Recording never
//! allocates.

use crate::ipc::{DeclineReason, IpcError, Mword};
use crate::sched::ThreadId;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use heapless::HistoryBuffer;
use spin::Mutex;

/// Number of events kept
pub const TRACE_DEPTH: usize = 64;

/// One traced IPC event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcEvent {
    ShortcutHit {
        from: ThreadId,
        to: ThreadId,
    },
    ShortcutMiss {
        from: ThreadId,
        reason: DeclineReason,
    },
    /// Handshake finished (short message delivered or long transfer started)
    Rendezvous {
        from: ThreadId,
        to: ThreadId,
        result: Result<(), IpcError>,
    },
    /// Page fault forwarded to the pager
    PageFault {
        thread: ThreadId,
        addr: Mword,
        result: Result<(), IpcError>,
    },
    LongTransfer {
        from: ThreadId,
        to: ThreadId,
        words: usize,
        result: Result<(), IpcError>,
    },
}

pub struct TraceBuffer {
    events: Mutex<HistoryBuffer<IpcEvent, TRACE_DEPTH>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBuffer {
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(HistoryBuffer::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: IpcEvent) {
        match event {
            IpcEvent::ShortcutHit { .. } => {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
            IpcEvent::ShortcutMiss { .. } => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.events.lock().write(event);
    }

    /// Recorded events, oldest first
    pub fn recent(&self) -> Vec<IpcEvent> {
        self.events.lock().oldest_ordered().copied().collect()
    }

    pub fn shortcut_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn shortcut_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
