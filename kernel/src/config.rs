//! IPC configuration
//!
//! Build-time defaults come from cargo features; a kernel embedding the
//! core can override any of them when constructing the [`Kernel`].
//!
//! [`Kernel`]: crate::Kernel

/// Default number of times a long-IPC copy may page in the same address
/// before the kernel gives up.
pub const DEFAULT_PAGEIN_RETRY_LIMIT: u32 = 8;

/// Tunables of the IPC core
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcConfig {
    /// Attempt the register-only fast path before the general path
    pub shortcut: bool,
    /// A send with the deceit bit set does not switch to the receiver
    pub deceit_bit_disables_switch: bool,
    /// Switch to the partner after a successful short IPC
    pub switch_on_ipc: bool,
    /// Log failed page-fault IPC with the send/receive error
    pub conservative: bool,
    /// Sending to an interrupt id acknowledges (w0 = 0) or detaches (w0 = 1)
    pub multi_irq_attach: bool,
    /// Page-ins of one address during a long copy before panicking
    pub pagein_retry_limit: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            shortcut: !cfg!(feature = "no-shortcut"),
            deceit_bit_disables_switch: cfg!(feature = "deceit-disables-switch"),
            switch_on_ipc: true,
            conservative: cfg!(feature = "conservative"),
            multi_irq_attach: cfg!(feature = "multi-irq-attach"),
            pagein_retry_limit: DEFAULT_PAGEIN_RETRY_LIMIT,
        }
    }
}

impl IpcConfig {
    /// Configuration with the fast path turned off
    pub fn without_shortcut() -> Self {
        Self {
            shortcut: false,
            ..Self::default()
        }
    }
}
