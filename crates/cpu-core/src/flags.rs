//! EFLAGS layout and the lazily evaluated arithmetic flags.
//!
//! The six arithmetic flags are kept as either a settled boolean or a pending
//! `(operands, method)` record. A pending flag is evaluated the first time it is
//! read and memoized; instructions whose flags are never consulted never pay for
//! the computation.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::types::Width;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EFlags: u32 {
        const CF = 1 << 0;   // Carry
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;   // Parity
        const AF = 1 << 4;   // Aux carry
        const ZF = 1 << 6;   // Zero
        const SF = 1 << 7;   // Sign
        const TF = 1 << 8;   // Trap
        const IF = 1 << 9;   // Interrupt enable
        const DF = 1 << 10;  // Direction
        const OF = 1 << 11;  // Overflow
        const IOPL0 = 1 << 12; // IOPL bit 0
        const IOPL1 = 1 << 13; // IOPL bit 1
        const NT = 1 << 14;  // Nested task
        const RF = 1 << 16;  // Resume
        const VM = 1 << 17;  // Virtual 8086
        const AC = 1 << 18;  // Alignment check
        const VIF = 1 << 19; // Virtual IF
        const VIP = 1 << 20; // Virtual IF pending
        const ID = 1 << 21;  // CPUID available
    }
}

impl EFlags {
    pub fn iopl(self) -> u8 {
        ((self.bits() >> 12) & 0b11) as u8
    }
    pub fn with_iopl(self, iopl: u8) -> Self {
        let cleared = self.bits() & !(0b11 << 12);
        let val = (iopl as u32 & 0b11) << 12;
        EFlags::from_bits_retain(cleared | val)
    }
}

/// The non-arithmetic EFLAGS bits, held individually.
///
/// `virtual8086` and `alignment_check` are only changed through
/// [`Cpu::set_eflags`](crate::cpu::Cpu::set_eflags) and the dispatcher, since
/// both have side effects on the rest of the processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    pub trap: bool,
    pub interrupt_enable: bool,
    /// STI shadow: IF becomes set after the next instruction boundary.
    pub interrupt_enable_soon: bool,
    pub direction: bool,
    pub iopl: u8,
    pub nested_task: bool,
    pub resume: bool,
    pub(crate) virtual8086: bool,
    pub(crate) alignment_check: bool,
    pub virtual_interrupt: bool,
    pub virtual_interrupt_pending: bool,
    pub id: bool,
}

impl ControlFlags {
    pub fn virtual8086(&self) -> bool { self.virtual8086 }
    pub fn alignment_check(&self) -> bool { self.alignment_check }
}

#[inline]
fn parity8(x: u8) -> bool {
    (x.count_ones() & 1) == 0
}

#[inline]
fn msb(width: Width, v: u64) -> bool { (v & width.sign_bit()) != 0 }

/// Formula used to settle a pending flag. Operands are `[a, b, c]`; the meaning
/// of each slot is given per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagMethod {
    /// `a != 0`
    NonZero,
    /// most significant bit of `a`
    HighBit(Width),
    /// `a` is a widened result; set when it does not fit the width
    Twiddle(Width),
    /// unsigned `a < b`
    Below(Width),
    /// unsigned `a < b + c` (subtract with borrow-in `c`)
    BelowWithBorrow(Width),
    /// last bit shifted out when `a` is shifted left by `b`
    ShlOut(Width),
    /// last bit shifted out when `a` is shifted right by `b`
    ShrOut,
    /// signed overflow of `a + b = c`
    AddOverflow(Width),
    /// signed overflow of `a - b = c`
    SubOverflow(Width),
    /// increment overflow: result `a` is the minimum signed value
    IncOverflow(Width),
    /// decrement overflow: result `a` is the maximum signed value
    DecOverflow(Width),
    /// most significant bit of `a` xor `b != 0`
    HighBitXor(Width),
    /// bit 4 of `a ^ b ^ c`
    NibbleCarry,
    /// low nibble of `a` is zero
    LowNibbleZero,
    /// low nibble of `a` is 0xF
    LowNibbleMax,
    /// low nibble of `a` is non-zero
    LowNibbleNonZero,
    /// `a` truncated to width is zero
    Zero(Width),
    /// even parity of the low byte of `a`
    Parity,
}

impl FlagMethod {
    pub fn evaluate(self, [a, b, c]: [u64; 3]) -> bool {
        use FlagMethod::*;
        match self {
            NonZero => a != 0,
            HighBit(w) => msb(w, a),
            Twiddle(w) => (a & !w.mask()) != 0,
            Below(w) => (a & w.mask()) < (b & w.mask()),
            BelowWithBorrow(w) => (a & w.mask()) < (b & w.mask()) + (c & 1),
            ShlOut(w) => {
                let bits = w.bits() as u64;
                b != 0 && b <= bits && ((a >> (bits - b)) & 1) != 0
            }
            ShrOut => b != 0 && b <= 64 && ((a >> (b - 1)) & 1) != 0,
            AddOverflow(w) => ((a ^ c) & (b ^ c) & w.sign_bit()) != 0,
            SubOverflow(w) => ((a ^ b) & (a ^ c) & w.sign_bit()) != 0,
            IncOverflow(w) => (a & w.mask()) == w.sign_bit(),
            DecOverflow(w) => (a & w.mask()) == w.sign_bit() - 1,
            HighBitXor(w) => msb(w, a) != (b != 0),
            NibbleCarry => ((a ^ b ^ c) & 0x10) != 0,
            LowNibbleZero => (a & 0xF) == 0,
            LowNibbleMax => (a & 0xF) == 0xF,
            LowNibbleNonZero => (a & 0xF) != 0,
            Zero(w) => (a & w.mask()) == 0,
            Parity => parity8(a as u8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LazyFlag {
    Settled(bool),
    Pending { operands: [u64; 3], method: FlagMethod },
}

impl Default for LazyFlag {
    fn default() -> Self { LazyFlag::Settled(false) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Carry,
    Parity,
    Auxiliary,
    Zero,
    Sign,
    Overflow,
}

impl Flag {
    pub const ALL: [Flag; 6] = [Flag::Carry, Flag::Parity, Flag::Auxiliary, Flag::Zero, Flag::Sign, Flag::Overflow];

    pub fn bit(self) -> EFlags {
        match self {
            Flag::Carry => EFlags::CF,
            Flag::Parity => EFlags::PF,
            Flag::Auxiliary => EFlags::AF,
            Flag::Zero => EFlags::ZF,
            Flag::Sign => EFlags::SF,
            Flag::Overflow => EFlags::OF,
        }
    }
}

/// CF, PF, AF, ZF, SF and OF, each settled or pending.
#[derive(Debug, Clone, Default)]
pub struct ConditionFlags {
    slots: [LazyFlag; 6],
    #[cfg(test)]
    evaluations: u32,
}

impl ConditionFlags {
    pub fn get(&mut self, flag: Flag) -> bool {
        let slot = &mut self.slots[flag as usize];
        match *slot {
            LazyFlag::Settled(v) => v,
            LazyFlag::Pending { operands, method } => {
                let v = method.evaluate(operands);
                *slot = LazyFlag::Settled(v);
                #[cfg(test)]
                {
                    self.evaluations += 1;
                }
                v
            }
        }
    }

    pub fn set(&mut self, flag: Flag, value: bool) {
        self.slots[flag as usize] = LazyFlag::Settled(value);
    }

    /// Re-arm `flag` with a formula to be evaluated on the next read.
    pub fn defer(&mut self, flag: Flag, method: FlagMethod, operands: [u64; 3]) {
        self.slots[flag as usize] = LazyFlag::Pending { operands, method };
    }

    pub fn is_pending(&self, flag: Flag) -> bool {
        matches!(self.slots[flag as usize], LazyFlag::Pending { .. })
    }

    pub fn carry(&mut self) -> bool { self.get(Flag::Carry) }
    pub fn parity(&mut self) -> bool { self.get(Flag::Parity) }
    pub fn auxiliary_carry(&mut self) -> bool { self.get(Flag::Auxiliary) }
    pub fn zero(&mut self) -> bool { self.get(Flag::Zero) }
    pub fn sign(&mut self) -> bool { self.get(Flag::Sign) }
    pub fn overflow(&mut self) -> bool { self.get(Flag::Overflow) }

    /// SF, ZF and PF from a result.
    pub fn set_result(&mut self, width: Width, result: u64) {
        let ops = [result, 0, 0];
        self.defer(Flag::Sign, FlagMethod::HighBit(width), ops);
        self.defer(Flag::Zero, FlagMethod::Zero(width), ops);
        self.defer(Flag::Parity, FlagMethod::Parity, ops);
    }

    /// ADD/ADC. `result` is the unmasked sum including any carry-in.
    pub fn set_add(&mut self, width: Width, a: u64, b: u64, result: u64) {
        self.set_result(width, result);
        self.defer(Flag::Carry, FlagMethod::Twiddle(width), [result, 0, 0]);
        self.defer(Flag::Overflow, FlagMethod::AddOverflow(width), [a, b, result]);
        self.defer(Flag::Auxiliary, FlagMethod::NibbleCarry, [a, b, result]);
    }

    /// SUB/CMP/SBB with borrow-in `borrow`.
    pub fn set_sub(&mut self, width: Width, a: u64, b: u64, borrow: bool, result: u64) {
        self.set_result(width, result);
        if borrow {
            self.defer(Flag::Carry, FlagMethod::BelowWithBorrow(width), [a, b, 1]);
        } else {
            self.defer(Flag::Carry, FlagMethod::Below(width), [a, b, 0]);
        }
        self.defer(Flag::Overflow, FlagMethod::SubOverflow(width), [a, b, result]);
        self.defer(Flag::Auxiliary, FlagMethod::NibbleCarry, [a, b, result]);
    }

    /// AND/OR/XOR/TEST.
    pub fn set_logic(&mut self, width: Width, result: u64) {
        self.set_result(width, result);
        self.set(Flag::Carry, false);
        self.set(Flag::Overflow, false);
        self.set(Flag::Auxiliary, false);
    }

    /// INC leaves CF untouched.
    pub fn set_inc(&mut self, width: Width, result: u64) {
        self.set_result(width, result);
        self.defer(Flag::Overflow, FlagMethod::IncOverflow(width), [result, 0, 0]);
        self.defer(Flag::Auxiliary, FlagMethod::LowNibbleZero, [result, 0, 0]);
    }

    /// DEC leaves CF untouched.
    pub fn set_dec(&mut self, width: Width, result: u64) {
        self.set_result(width, result);
        self.defer(Flag::Overflow, FlagMethod::DecOverflow(width), [result, 0, 0]);
        self.defer(Flag::Auxiliary, FlagMethod::LowNibbleMax, [result, 0, 0]);
    }

    pub fn set_neg(&mut self, width: Width, operand: u64, result: u64) {
        self.set_result(width, result);
        self.defer(Flag::Carry, FlagMethod::NonZero, [operand & width.mask(), 0, 0]);
        self.defer(Flag::Overflow, FlagMethod::IncOverflow(width), [result, 0, 0]);
        self.defer(Flag::Auxiliary, FlagMethod::LowNibbleNonZero, [result, 0, 0]);
    }

    /// SHL/SAL by a non-zero masked count.
    pub fn set_shl(&mut self, width: Width, value: u64, count: u32, result: u64) {
        if count == 0 { return; }
        self.set_result(width, result);
        self.defer(Flag::Carry, FlagMethod::ShlOut(width), [value, count as u64, 0]);
        self.defer(Flag::Overflow, FlagMethod::HighBitXor(width), [result, (value >> (width.bits() - count.min(width.bits()))) & 1, 0]);
    }

    /// SHR by a non-zero masked count.
    pub fn set_shr(&mut self, width: Width, value: u64, count: u32, result: u64) {
        if count == 0 { return; }
        self.set_result(width, result);
        self.defer(Flag::Carry, FlagMethod::ShrOut, [value & width.mask(), count as u64, 0]);
        self.defer(Flag::Overflow, FlagMethod::HighBit(width), [value, 0, 0]);
    }

    /// MUL/IMUL: CF = OF = upper half non-zero (or not a sign extension).
    pub fn set_mul(&mut self, overflowed: u64) {
        self.defer(Flag::Carry, FlagMethod::NonZero, [overflowed, 0, 0]);
        self.defer(Flag::Overflow, FlagMethod::NonZero, [overflowed, 0, 0]);
    }

    /// Settle all six flags into their EFLAGS bit positions.
    pub fn to_eflags(&mut self) -> EFlags {
        let mut out = EFlags::empty();
        for flag in Flag::ALL {
            out.set(flag.bit(), self.get(flag));
        }
        out
    }

    pub fn load_eflags(&mut self, eflags: EFlags) {
        for flag in Flag::ALL {
            self.set(flag, eflags.contains(flag.bit()));
        }
    }

    #[cfg(test)]
    pub(crate) fn evaluations(&self) -> u32 { self.evaluations }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add8_flags_basic() {
        let mut f = ConditionFlags::default();
        f.set_add(Width::W8, 0x7F, 0x01, 0x80);
        assert!(!f.carry());
        assert!(f.overflow()); // 127 + 1 -> -128 overflow
        assert!(f.sign());
        assert!(!f.zero());
        assert!(f.auxiliary_carry());
    }

    #[test]
    fn add8_carry() {
        let mut f = ConditionFlags::default();
        f.set_add(Width::W8, 0xFF, 0x01, 0x100);
        assert!(f.carry());
        assert!(f.zero());
        assert!(!f.overflow());
        assert!(f.parity());
    }

    #[test]
    fn sub16_borrow() {
        let mut f = ConditionFlags::default();
        let r = 0u64.wrapping_sub(1) & 0xFFFF;
        f.set_sub(Width::W16, 0x0000, 0x0001, false, r);
        assert!(f.carry());
        assert!(f.sign());
        assert!(!f.zero());
        assert!(!f.overflow());
    }

    #[test]
    fn sbb32_borrow_in() {
        let mut f = ConditionFlags::default();
        f.set_sub(Width::W32, 5, 5, true, 0xFFFF_FFFF);
        assert!(f.carry());
        f.set_sub(Width::W32, 6, 5, true, 0);
        assert!(!f.carry());
        assert!(f.zero());
    }

    #[test]
    fn pending_flag_evaluates_once() {
        let mut f = ConditionFlags::default();
        f.set_add(Width::W32, 0xFFFF_FFFF, 1, 0x1_0000_0000);
        assert!(f.is_pending(Flag::Carry));
        assert_eq!(f.evaluations(), 0);
        assert!(f.carry());
        assert_eq!(f.evaluations(), 1);
        assert!(f.carry());
        assert_eq!(f.evaluations(), 1);
        assert!(!f.is_pending(Flag::Carry));
        // other flags stay pending until read
        assert!(f.is_pending(Flag::Overflow));
    }

    #[test]
    fn write_settles_pending_flag() {
        let mut f = ConditionFlags::default();
        f.set_add(Width::W8, 1, 1, 2);
        f.set(Flag::Zero, true);
        assert!(f.zero());
        assert_eq!(f.evaluations(), 0);
    }

    #[test]
    fn inc_dec_overflow_and_aux() {
        let mut f = ConditionFlags::default();
        f.set_inc(Width::W16, 0x8000);
        assert!(f.overflow());
        assert!(f.auxiliary_carry());
        f.set_dec(Width::W8, 0x7F);
        assert!(f.overflow());
        assert!(f.auxiliary_carry());
    }

    #[test]
    fn shifts_carry_out() {
        let mut f = ConditionFlags::default();
        f.set_shl(Width::W8, 0x81, 1, 0x02);
        assert!(f.carry());
        assert!(f.overflow());
        f.set_shr(Width::W32, 0b10, 2, 0);
        assert!(f.carry());
        assert!(f.zero());
    }

    #[test]
    fn neg_sets_carry_unless_zero() {
        let mut f = ConditionFlags::default();
        f.set_neg(Width::W32, 0, 0);
        assert!(!f.carry());
        assert!(f.zero());
        assert!(!f.auxiliary_carry());

        f.set_neg(Width::W32, 0x8000_0000, 0x8000_0000);
        assert!(f.carry());
        assert!(f.overflow());
        assert!(f.sign());

        f.set_neg(Width::W8, 0x01, 0xFF);
        assert!(f.carry());
        assert!(!f.overflow());
        assert!(f.auxiliary_carry());
    }

    #[test]
    fn mul_carry_and_overflow_track_upper_half() {
        let mut f = ConditionFlags::default();
        f.set_mul(0);
        assert!(!f.carry() && !f.overflow());
        f.set_mul(0x1);
        assert!(f.carry() && f.overflow());
    }

    #[test]
    fn logic_clears_carry_and_overflow() {
        let mut f = ConditionFlags::default();
        f.set(Flag::Carry, true);
        f.set_logic(Width::W32, 0x8000_0000);
        assert!(!f.carry());
        assert!(!f.overflow());
        assert!(f.sign());
    }

    #[test]
    fn eflags_round_trip() {
        let mut f = ConditionFlags::default();
        let bits = EFlags::CF | EFlags::ZF | EFlags::OF;
        f.load_eflags(bits);
        assert_eq!(f.to_eflags(), bits);
    }

    #[test]
    fn iopl_bits() {
        let fl = EFlags::IF.with_iopl(3);
        assert_eq!(fl.iopl(), 3);
        assert!(fl.contains(EFlags::IF));
    }
}
