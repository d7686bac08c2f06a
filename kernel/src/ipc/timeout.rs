//! IPC timeout words
//!
//! One machine word packs four timeouts: send, receive, send page fault and
//! receive page fault.
//!
//! ```text
//!  31      24 23      16 15   12 11    8 7     4 3     0
//! +----------+----------+-------+-------+-------+-------+
//! | rcv_man  | snd_man  | snd_pf| rcv_pf| snd_e | rcv_e |
//! +----------+----------+-------+-------+-------+-------+
//! ```
//!
//! An exponent of 0 means "never"; a mantissa of 0 with a non-zero exponent
//! means "zero"; otherwise the timeout is `man * 4^(15 - e)` microseconds.
//! Page-fault fields are bare exponents: 0 never, 15 zero, `p` otherwise
//! `4^(15 - p)` microseconds.

use super::Mword;

/// What a single timeout field asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitSpec {
    /// Try once, never sleep
    Zero,
    /// Sleep until the partner or a cancel wakes us
    Never,
    /// Sleep at most this many microseconds
    Micros(u64),
}

impl WaitSpec {
    fn decode(man: Mword, exp: Mword) -> Self {
        if exp == 0 {
            WaitSpec::Never
        } else if man == 0 {
            WaitSpec::Zero
        } else {
            WaitSpec::Micros((man as u64) << ((15 - exp) << 1))
        }
    }

    /// Absolute deadline for a finite wait starting at `now`
    pub fn deadline(self, now: u64) -> Option<u64> {
        match self {
            WaitSpec::Micros(us) => Some(now.saturating_add(us)),
            _ => None,
        }
    }
}

const RCV_EXP_SHIFT: u32 = 0;
const SND_EXP_SHIFT: u32 = 4;
const RCV_PFAULT_SHIFT: u32 = 8;
const SND_PFAULT_SHIFT: u32 = 12;
const SND_MAN_SHIFT: u32 = 16;
const RCV_MAN_SHIFT: u32 = 24;

const NIBBLE: Mword = 0xf;
const BYTE: Mword = 0xff;

/// Page-fault exponent meaning "zero timeout"
pub const PF_ZERO: Mword = 15;

/// Packed IPC timeout word
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Timeout(pub Mword);

impl Timeout {
    /// Every field infinite
    pub const NEVER: Self = Self(0);

    /// Send and receive both zero, page faults infinite
    pub const ZERO: Self = Self::new(0, 1, 0, 1, 0, 0);

    /// Build a timeout word from its fields
    pub const fn new(
        snd_man: Mword,
        snd_exp: Mword,
        rcv_man: Mword,
        rcv_exp: Mword,
        snd_pfault: Mword,
        rcv_pfault: Mword,
    ) -> Self {
        Self(
            ((snd_man & BYTE) << SND_MAN_SHIFT)
                | ((snd_exp & NIBBLE) << SND_EXP_SHIFT)
                | ((rcv_man & BYTE) << RCV_MAN_SHIFT)
                | ((rcv_exp & NIBBLE) << RCV_EXP_SHIFT)
                | ((snd_pfault & NIBBLE) << SND_PFAULT_SHIFT)
                | ((rcv_pfault & NIBBLE) << RCV_PFAULT_SHIFT),
        )
    }

    /// Timeout used for page-fault IPC during a long transfer.
    ///
    /// Both directions use exponent `pf` with mantissa 1; the value 15
    /// selects the zero timeout.
    pub const fn pagefault(pf: Mword) -> Self {
        if pf & NIBBLE == PF_ZERO {
            Self::new(0, 1, 0, 1, 0, 0)
        } else {
            Self::new(1, pf, 1, pf, 0, 0)
        }
    }

    /// Replace the receive fields, keeping the rest
    pub const fn with_rcv(self, man: Mword, exp: Mword) -> Self {
        let cleared = self.0 & !((BYTE << RCV_MAN_SHIFT) | (NIBBLE << RCV_EXP_SHIFT));
        Self(cleared | ((man & BYTE) << RCV_MAN_SHIFT) | ((exp & NIBBLE) << RCV_EXP_SHIFT))
    }

    /// Replace the send fields, keeping the rest
    pub const fn with_snd(self, man: Mword, exp: Mword) -> Self {
        let cleared = self.0 & !((BYTE << SND_MAN_SHIFT) | (NIBBLE << SND_EXP_SHIFT));
        Self(cleared | ((man & BYTE) << SND_MAN_SHIFT) | ((exp & NIBBLE) << SND_EXP_SHIFT))
    }

    /// Replace both page-fault fields
    pub const fn with_pfault(self, snd: Mword, rcv: Mword) -> Self {
        let cleared = self.0 & !((NIBBLE << SND_PFAULT_SHIFT) | (NIBBLE << RCV_PFAULT_SHIFT));
        Self(cleared | ((snd & NIBBLE) << SND_PFAULT_SHIFT) | ((rcv & NIBBLE) << RCV_PFAULT_SHIFT))
    }

    pub const fn rcv_exp(self) -> Mword {
        (self.0 >> RCV_EXP_SHIFT) & NIBBLE
    }

    pub const fn snd_exp(self) -> Mword {
        (self.0 >> SND_EXP_SHIFT) & NIBBLE
    }

    pub const fn rcv_pfault(self) -> Mword {
        (self.0 >> RCV_PFAULT_SHIFT) & NIBBLE
    }

    pub const fn snd_pfault(self) -> Mword {
        (self.0 >> SND_PFAULT_SHIFT) & NIBBLE
    }

    pub const fn snd_man(self) -> Mword {
        (self.0 >> SND_MAN_SHIFT) & BYTE
    }

    pub const fn rcv_man(self) -> Mword {
        (self.0 >> RCV_MAN_SHIFT) & BYTE
    }

    /// Decoded send timeout
    pub fn snd(self) -> WaitSpec {
        WaitSpec::decode(self.snd_man(), self.snd_exp())
    }

    /// Decoded receive timeout
    pub fn rcv(self) -> WaitSpec {
        WaitSpec::decode(self.rcv_man(), self.rcv_exp())
    }

    /// Whether the receive part is a poll
    pub fn rcv_is_zero(self) -> bool {
        self.rcv() == WaitSpec::Zero
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_never_and_zero() {
        assert_eq!(Timeout::NEVER.snd(), WaitSpec::Never);
        assert_eq!(Timeout::NEVER.rcv(), WaitSpec::Never);
        assert_eq!(Timeout::ZERO.snd(), WaitSpec::Zero);
        assert_eq!(Timeout::ZERO.rcv(), WaitSpec::Zero);
        assert!(Timeout::ZERO.rcv_is_zero());
    }

    #[test]
    fn test_finite_values() {
        // 1 * 4^(15-15) = 1us
        assert_eq!(Timeout::new(1, 15, 0, 0, 0, 0).snd(), WaitSpec::Micros(1));
        // 10 * 4^(15-10) = 10240us
        assert_eq!(Timeout::new(0, 0, 10, 10, 0, 0).rcv(), WaitSpec::Micros(10 * 1024));
        assert_eq!(WaitSpec::Micros(5).deadline(100), Some(105));
        assert_eq!(WaitSpec::Never.deadline(100), None);
    }

    #[test]
    fn test_pagefault_sentinel() {
        let zero = Timeout::pagefault(PF_ZERO);
        assert_eq!(zero.snd(), WaitSpec::Zero);
        assert_eq!(zero.rcv(), WaitSpec::Zero);

        let never = Timeout::pagefault(0);
        assert_eq!(never.snd(), WaitSpec::Never);

        // mantissa 1, exponent 14 -> 4us
        assert_eq!(Timeout::pagefault(14).rcv(), WaitSpec::Micros(4));
    }

    #[test]
    fn test_field_setters_keep_others() {
        let t = Timeout::NEVER.with_pfault(3, 4).with_snd(1, 2).with_rcv(5, 6);
        assert_eq!(t.snd_pfault(), 3);
        assert_eq!(t.rcv_pfault(), 4);
        assert_eq!((t.snd_man(), t.snd_exp()), (1, 2));
        assert_eq!((t.rcv_man(), t.rcv_exp()), (5, 6));
    }

    proptest! {
        #[test]
        fn prop_fields_roundtrip(sm in 0usize..256, se in 0usize..16, rm in 0usize..256,
                                 re in 0usize..16, sp in 0usize..16, rp in 0usize..16) {
            let t = Timeout::new(sm, se, rm, re, sp, rp);
            prop_assert_eq!(t.snd_man(), sm);
            prop_assert_eq!(t.snd_exp(), se);
            prop_assert_eq!(t.rcv_man(), rm);
            prop_assert_eq!(t.rcv_exp(), re);
            prop_assert_eq!(t.snd_pfault(), sp);
            prop_assert_eq!(t.rcv_pfault(), rp);
        }

        #[test]
        fn prop_finite_grows_with_mantissa(man in 1usize..255, exp in 1usize..16) {
            let lo = Timeout::NEVER.with_rcv(man, exp).rcv();
            let hi = Timeout::NEVER.with_rcv(man + 1, exp).rcv();
            match (lo, hi) {
                (WaitSpec::Micros(a), WaitSpec::Micros(b)) => prop_assert!(a < b),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn prop_exponent_zero_is_never(man in 0usize..256) {
            prop_assert_eq!(Timeout::NEVER.with_snd(man, 0).snd(), WaitSpec::Never);
        }
    }
}
