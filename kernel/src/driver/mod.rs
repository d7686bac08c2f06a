//! # Device support
//!
//! Drivers live at user level. The kernel's part is turning hardware
//! interrupts into IPC: see [`irq`].

pub mod irq;

pub use irq::{Irq, IrqTable, MAX_IRQS};
