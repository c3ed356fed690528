//! Segment descriptors and the segments built from them.
//!
//! An 8-byte descriptor plus a selector decodes into one [`SegmentKind`] chosen
//! by the 5-bit code `S:type`. Behavior that differs between kinds (address
//! rule, writability, gate layout) is looked up in a per-kind table rather than
//! spread over one type per descriptor variant.

use serde::{Deserialize, Serialize};

use crate::exceptions::Exception;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SegmentSelector(pub u16);

impl SegmentSelector {
    pub const NULL: SegmentSelector = SegmentSelector(0);

    pub fn index(self) -> u16 { (self.0 >> 3) & 0x1FFF }
    pub fn ti(self) -> bool { (self.0 & 0x4) != 0 }
    pub fn rpl(self) -> u8 { (self.0 & 0x3) as u8 }
    /// Index and table bits with RPL cleared, as reported in error codes.
    pub fn masked(self) -> u16 { self.0 & 0xFFFC }
    /// A null selector references GDT entry 0, whatever its RPL.
    pub fn is_null(self) -> bool { self.masked() == 0 }
    pub fn with_rpl(self, rpl: u8) -> Self { SegmentSelector((self.0 & !0x3) | (rpl as u16 & 0x3)) }
}

/// Why a raw descriptor could not be turned into a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DescriptorError {
    #[error("reserved descriptor type {0:#04x}")]
    Reserved(u8),
    #[error("descriptor type {0:#04x} is not implemented")]
    Unimplemented(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    ReadOnlyData,
    ReadOnlyDataAccessed,
    ReadWriteData,
    ReadWriteDataAccessed,
    ExpandDownData,
    ExpandDownDataAccessed,
    ExecuteOnlyCode,
    ExecuteReadCode,
    ExecuteReadCodeAccessed,
    ConformingExecuteReadCode,
    ConformingExecuteReadCodeAccessed,
    Tss16Available,
    Tss16Busy,
    Tss32Available,
    Tss32Busy,
    Ldt,
    TaskGate,
    InterruptGate16,
    InterruptGate32,
    TrapGate16,
    TrapGate32,
    CallGate16,
    CallGate32,
}

/// How an offset is validated against a segment's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRule {
    /// `offset <= limit`
    ExpandUp,
    /// `limit < offset <= 0xFFFF or 0xFFFF_FFFF`, by the B flag
    ExpandDown,
    /// Gates describe an entry point, not memory.
    NoAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBehavior {
    /// The 5-bit `S:type` code this kind decodes from.
    pub type_code: u8,
    pub address: AddressRule,
    pub executable: bool,
    pub readable: bool,
    pub writable: bool,
    pub conforming: bool,
    pub system: bool,
    pub gate: bool,
}

const fn data(type_code: u8, writable: bool, expand_down: bool) -> SegmentBehavior {
    SegmentBehavior {
        type_code,
        address: if expand_down { AddressRule::ExpandDown } else { AddressRule::ExpandUp },
        executable: false,
        readable: true,
        writable,
        conforming: false,
        system: false,
        gate: false,
    }
}

const fn code(type_code: u8, readable: bool, conforming: bool) -> SegmentBehavior {
    SegmentBehavior {
        type_code,
        address: AddressRule::ExpandUp,
        executable: true,
        readable,
        writable: false,
        conforming,
        system: false,
        gate: false,
    }
}

const fn system(type_code: u8, gate: bool) -> SegmentBehavior {
    SegmentBehavior {
        type_code,
        address: if gate { AddressRule::NoAddress } else { AddressRule::ExpandUp },
        executable: false,
        readable: false,
        writable: false,
        conforming: false,
        system: true,
        gate,
    }
}

impl SegmentKind {
    pub const ALL: [SegmentKind; 23] = [
        SegmentKind::ReadOnlyData,
        SegmentKind::ReadOnlyDataAccessed,
        SegmentKind::ReadWriteData,
        SegmentKind::ReadWriteDataAccessed,
        SegmentKind::ExpandDownData,
        SegmentKind::ExpandDownDataAccessed,
        SegmentKind::ExecuteOnlyCode,
        SegmentKind::ExecuteReadCode,
        SegmentKind::ExecuteReadCodeAccessed,
        SegmentKind::ConformingExecuteReadCode,
        SegmentKind::ConformingExecuteReadCodeAccessed,
        SegmentKind::Tss16Available,
        SegmentKind::Tss16Busy,
        SegmentKind::Tss32Available,
        SegmentKind::Tss32Busy,
        SegmentKind::Ldt,
        SegmentKind::TaskGate,
        SegmentKind::InterruptGate16,
        SegmentKind::InterruptGate32,
        SegmentKind::TrapGate16,
        SegmentKind::TrapGate32,
        SegmentKind::CallGate16,
        SegmentKind::CallGate32,
    ];

    pub const fn behavior(self) -> SegmentBehavior {
        use SegmentKind::*;
        match self {
            ReadOnlyData => data(0x10, false, false),
            ReadOnlyDataAccessed => data(0x11, false, false),
            ReadWriteData => data(0x12, true, false),
            ReadWriteDataAccessed => data(0x13, true, false),
            ExpandDownData => data(0x16, true, true),
            ExpandDownDataAccessed => data(0x17, true, true),
            ExecuteOnlyCode => code(0x18, false, false),
            ExecuteReadCode => code(0x1A, true, false),
            ExecuteReadCodeAccessed => code(0x1B, true, false),
            ConformingExecuteReadCode => code(0x1E, true, true),
            ConformingExecuteReadCodeAccessed => code(0x1F, true, true),
            Tss16Available => system(0x01, false),
            Ldt => system(0x02, false),
            Tss16Busy => system(0x03, false),
            CallGate16 => system(0x04, true),
            TaskGate => system(0x05, true),
            InterruptGate16 => system(0x06, true),
            TrapGate16 => system(0x07, true),
            Tss32Available => system(0x09, false),
            Tss32Busy => system(0x0B, false),
            CallGate32 => system(0x0C, true),
            InterruptGate32 => system(0x0E, true),
            TrapGate32 => system(0x0F, true),
        }
    }

    /// Map a 5-bit `S:type` code to a kind.
    pub fn from_type_code(code: u8) -> Result<SegmentKind, DescriptorError> {
        use SegmentKind::*;
        Ok(match code & 0x1F {
            0x00 | 0x08 | 0x0A | 0x0D => return Err(DescriptorError::Reserved(code)),
            0x01 => Tss16Available,
            0x02 => Ldt,
            0x03 => Tss16Busy,
            0x04 => CallGate16,
            0x05 => TaskGate,
            0x06 => InterruptGate16,
            0x07 => TrapGate16,
            0x09 => Tss32Available,
            0x0B => Tss32Busy,
            0x0C => CallGate32,
            0x0E => InterruptGate32,
            0x0F => TrapGate32,
            0x10 => ReadOnlyData,
            0x11 => ReadOnlyDataAccessed,
            0x12 => ReadWriteData,
            0x13 => ReadWriteDataAccessed,
            0x16 => ExpandDownData,
            0x17 => ExpandDownDataAccessed,
            0x18 => ExecuteOnlyCode,
            0x1A => ExecuteReadCode,
            0x1B => ExecuteReadCodeAccessed,
            0x1E => ConformingExecuteReadCode,
            0x1F => ConformingExecuteReadCodeAccessed,
            // read-only expand-down, execute-only accessed, execute-only conforming
            0x14 | 0x15 | 0x19 | 0x1C | 0x1D => return Err(DescriptorError::Unimplemented(code)),
            _ => unreachable!("type code is masked to five bits"),
        })
    }

    pub fn type_code(self) -> u8 { self.behavior().type_code }

    pub fn is_tss(self) -> bool {
        matches!(self, SegmentKind::Tss16Available | SegmentKind::Tss16Busy | SegmentKind::Tss32Available | SegmentKind::Tss32Busy)
    }

    pub fn is_32bit_tss(self) -> bool { matches!(self, SegmentKind::Tss32Available | SegmentKind::Tss32Busy) }

    /// Interrupt gates clear IF on entry; trap gates leave it alone.
    pub fn is_interrupt_gate(self) -> bool { matches!(self, SegmentKind::InterruptGate16 | SegmentKind::InterruptGate32) }

    pub fn is_trap_gate(self) -> bool { matches!(self, SegmentKind::TrapGate16 | SegmentKind::TrapGate32) }

    /// Width of the frame pushed through a gate, and of its target offset.
    pub fn is_32bit_gate(self) -> bool {
        matches!(self, SegmentKind::InterruptGate32 | SegmentKind::TrapGate32 | SegmentKind::CallGate32)
    }
}

/// Field view of a raw descriptor, used to build and re-encode descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub base: u32,
    /// 20-bit limit as stored, before granularity scaling.
    pub raw_limit: u32,
    /// 5-bit `S:type` code.
    pub type_code: u8,
    pub dpl: u8,
    pub present: bool,
    pub available: bool,
    pub default_size: bool,
    pub granularity: bool,
}

const DESC_PRESENT: u64 = 1 << 47;
const DESC_AVL: u64 = 1 << 52;
const DESC_DB: u64 = 1 << 54;
const DESC_G: u64 = 1 << 55;

impl Descriptor {
    pub fn from_raw(raw: u64) -> Self {
        let base = ((raw >> 16) & 0xFF_FFFF) as u32 | (((raw >> 56) & 0xFF) as u32) << 24;
        let raw_limit = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xF) as u32) << 16;
        Self {
            base,
            raw_limit,
            type_code: ((raw >> 40) & 0x1F) as u8,
            dpl: ((raw >> 45) & 0x3) as u8,
            present: (raw & DESC_PRESENT) != 0,
            available: (raw & DESC_AVL) != 0,
            default_size: (raw & DESC_DB) != 0,
            granularity: (raw & DESC_G) != 0,
        }
    }

    pub fn encode(&self) -> u64 {
        let base = self.base as u64;
        let limit = (self.raw_limit & 0xF_FFFF) as u64;
        let mut raw = limit & 0xFFFF;
        raw |= (base & 0xFF_FFFF) << 16;
        raw |= ((self.type_code & 0x1F) as u64) << 40;
        raw |= ((self.dpl & 0x3) as u64) << 45;
        if self.present { raw |= DESC_PRESENT; }
        raw |= (limit >> 16) << 48;
        if self.available { raw |= DESC_AVL; }
        if self.default_size { raw |= DESC_DB; }
        if self.granularity { raw |= DESC_G; }
        raw |= (base >> 24) << 56;
        raw
    }

    /// A present code/data/system descriptor with byte granularity.
    pub fn segment(kind: SegmentKind, base: u32, raw_limit: u32, dpl: u8) -> Self {
        Self { base, raw_limit, type_code: kind.type_code(), dpl, present: true, available: false, default_size: true, granularity: false }
    }

    /// A flat 4GiB segment (limit 0xFFFFF, 4KiB granular, 32-bit).
    pub fn flat(kind: SegmentKind, dpl: u8) -> Self {
        Self { granularity: true, ..Self::segment(kind, 0, 0xF_FFFF, dpl) }
    }

    /// Encode a gate: target selector, entry offset, and parameter count.
    pub fn gate(kind: SegmentKind, target: SegmentSelector, offset: u32, dpl: u8, present: bool, param_count: u8) -> u64 {
        let offset = offset as u64;
        let mut raw = offset & 0xFFFF;
        raw |= (target.0 as u64) << 16;
        raw |= ((param_count & 0x1F) as u64) << 32;
        raw |= ((kind.type_code() & 0x1F) as u64) << 40;
        raw |= ((dpl & 0x3) as u64) << 45;
        if present { raw |= DESC_PRESENT; }
        raw |= (offset >> 16) << 48;
        raw
    }

    /// Limit as seen by address checks: page granularity shifts in 12 one-bits.
    pub fn effective_limit(&self) -> u32 {
        if self.granularity { (self.raw_limit << 12) | 0xFFF } else { self.raw_limit }
    }
}

/// A segment decoded from a GDT/LDT/IDT descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedSegment {
    selector: SegmentSelector,
    kind: SegmentKind,
    base: u32,
    limit: u32,
    raw: u64,
}

impl ProtectedSegment {
    pub fn decode(selector: u16, raw: u64) -> Result<Self, DescriptorError> {
        let fields = Descriptor::from_raw(raw);
        let kind = SegmentKind::from_type_code(fields.type_code)?;
        let (base, limit) = if kind.behavior().gate { (0, 0) } else { (fields.base, fields.effective_limit()) };
        Ok(Self { selector: SegmentSelector(selector), kind, base, limit, raw })
    }

    /// Build a cache entry from fields whose kind is already known.
    pub fn from_descriptor(selector: u16, kind: SegmentKind, fields: Descriptor) -> Self {
        let fields = Descriptor { type_code: kind.type_code(), ..fields };
        let (base, limit) = if kind.behavior().gate { (0, 0) } else { (fields.base, fields.effective_limit()) };
        Self { selector: SegmentSelector(selector), kind, base, limit, raw: fields.encode() }
    }

    pub fn selector(&self) -> SegmentSelector { self.selector }
    pub fn kind(&self) -> SegmentKind { self.kind }
    pub fn behavior(&self) -> SegmentBehavior { self.kind.behavior() }
    pub fn base(&self) -> u32 { self.base }
    pub fn limit(&self) -> u32 { self.limit }
    pub fn raw(&self) -> u64 { self.raw }
    pub fn descriptor(&self) -> Descriptor { Descriptor::from_raw(self.raw) }

    pub fn dpl(&self) -> u8 { ((self.raw >> 45) & 0x3) as u8 }
    pub fn rpl(&self) -> u8 { self.selector.rpl() }
    pub fn present(&self) -> bool { (self.raw & DESC_PRESENT) != 0 }
    pub fn granularity(&self) -> bool { (self.raw & DESC_G) != 0 }
    pub fn default_size(&self) -> bool { (self.raw & DESC_DB) != 0 }

    /// RPL is the only attribute that changes after decode; the selector's low
    /// bits follow it.
    pub fn set_rpl(&mut self, rpl: u8) { self.selector = self.selector.with_rpl(rpl); }

    pub fn is_code(&self) -> bool { self.behavior().executable }
    pub fn is_conforming(&self) -> bool { self.behavior().conforming }
    pub fn is_system(&self) -> bool { self.behavior().system }
    pub fn is_writable_data(&self) -> bool {
        let b = self.behavior();
        b.writable && !b.executable && !b.system
    }

    /// Target code selector of a gate.
    pub fn target_selector(&self) -> SegmentSelector { SegmentSelector(((self.raw >> 16) & 0xFFFF) as u16) }

    /// Entry offset of a gate; 16-bit gates use only the low word.
    pub fn target_offset(&self) -> u32 {
        let low = (self.raw & 0xFFFF) as u32;
        if self.kind.is_32bit_gate() { low | (((self.raw >> 48) & 0xFFFF) as u32) << 16 } else { low }
    }

    pub fn parameter_count(&self) -> u8 { ((self.raw >> 32) & 0x1F) as u8 }

    pub fn check_address(&self, offset: u32) -> Result<(), Exception> {
        match self.behavior().address {
            AddressRule::ExpandUp if offset <= self.limit => Ok(()),
            AddressRule::ExpandDown => {
                let max = if self.default_size() { 0xFFFF_FFFF } else { 0xFFFF };
                if offset > self.limit && offset <= max { Ok(()) } else { Err(Exception::gp(0)) }
            }
            _ => Err(Exception::gp(0)),
        }
    }

    /// Copy with the type rewritten, as when a TSS is marked busy.
    pub fn with_kind(&self, kind: SegmentKind) -> Self {
        let raw = (self.raw & !(0x1F << 40)) | ((kind.type_code() as u64) << 40);
        Self { kind, raw, ..*self }
    }
}

/// A real-mode or virtual-8086 segment: base is the selector times 16 and the
/// limit is fixed at 64KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealSegment {
    selector: u16,
}

impl RealSegment {
    pub const LIMIT: u32 = 0xFFFF;

    pub fn new(selector: u16) -> Self { Self { selector } }
    pub fn selector(&self) -> u16 { self.selector }
    pub fn base(&self) -> u32 { (self.selector as u32) << 4 }
}

/// GDTR / IDTR: a base and limit without a selector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

impl DescriptorTable {
    pub fn new(base: u32, limit: u16) -> Self { Self { base, limit } }

    /// Whether the 8 bytes at `offset` lie within the table.
    pub fn contains(&self, offset: u32) -> bool { offset.checked_add(7).is_some_and(|end| end <= self.limit as u32) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Segment {
    /// Every access faults.
    #[default]
    Null,
    Real(RealSegment),
    Protected(ProtectedSegment),
    /// Virtual-8086 segment; DPL and RPL are both 3.
    Virtual8086(RealSegment),
}

impl Segment {
    pub fn real(selector: u16) -> Self { Segment::Real(RealSegment::new(selector)) }
    pub fn vm86(selector: u16) -> Self { Segment::Virtual8086(RealSegment::new(selector)) }

    pub fn selector(&self) -> u16 {
        match self {
            Segment::Null => 0,
            Segment::Real(s) | Segment::Virtual8086(s) => s.selector(),
            Segment::Protected(p) => p.selector().0,
        }
    }

    pub fn base(&self) -> u32 {
        match self {
            Segment::Null => 0,
            Segment::Real(s) | Segment::Virtual8086(s) => s.base(),
            Segment::Protected(p) => p.base(),
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            Segment::Null => 0,
            Segment::Real(_) | Segment::Virtual8086(_) => RealSegment::LIMIT,
            Segment::Protected(p) => p.limit(),
        }
    }

    pub fn rpl(&self) -> u8 {
        match self {
            Segment::Null | Segment::Real(_) => 0,
            Segment::Virtual8086(_) => 3,
            Segment::Protected(p) => p.rpl(),
        }
    }

    /// Only protected-mode segments carry a mutable RPL.
    pub fn set_rpl(&mut self, rpl: u8) {
        if let Segment::Protected(p) = self {
            p.set_rpl(rpl);
        }
    }

    pub fn dpl(&self) -> u8 {
        match self {
            Segment::Null | Segment::Real(_) => 0,
            Segment::Virtual8086(_) => 3,
            Segment::Protected(p) => p.dpl(),
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Segment::Null) }

    pub fn is_present(&self) -> bool {
        match self {
            Segment::Null => false,
            Segment::Protected(p) => p.present(),
            _ => true,
        }
    }

    /// D/B flag: 32-bit operand/stack size.
    pub fn default_size(&self) -> bool {
        match self {
            Segment::Protected(p) => p.default_size(),
            _ => false,
        }
    }

    pub fn kind(&self) -> Option<SegmentKind> {
        match self {
            Segment::Protected(p) => Some(p.kind()),
            _ => None,
        }
    }

    pub fn as_protected(&self) -> Option<&ProtectedSegment> {
        match self {
            Segment::Protected(p) => Some(p),
            _ => None,
        }
    }

    pub fn check_address(&self, offset: u32) -> Result<(), Exception> {
        match self {
            Segment::Null => Err(Exception::gp(0)),
            Segment::Real(_) | Segment::Virtual8086(_) => {
                if offset <= RealSegment::LIMIT { Ok(()) } else { Err(Exception::gp(0)) }
            }
            Segment::Protected(p) => p.check_address(offset),
        }
    }

    /// Check `offset` and return the linear address it maps to.
    pub fn translate(&self, offset: u32) -> Result<u32, Exception> {
        self.check_address(offset)?;
        Ok(self.base().wrapping_add(offset))
    }
}

/// Decode a descriptor fetched with `selector` into a segment.
pub fn decode(selector: u16, raw: u64) -> Result<Segment, DescriptorError> {
    ProtectedSegment::decode(selector, raw).map(Segment::Protected)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SegReg { ES, CS, SS, DS, FS, GS }

impl SegReg {
    pub const ALL: [SegReg; 6] = [SegReg::ES, SegReg::CS, SegReg::SS, SegReg::DS, SegReg::FS, SegReg::GS];
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegState {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
}

impl SegState {
    pub fn get(&self, r: SegReg) -> &Segment {
        match r {
            SegReg::CS => &self.cs,
            SegReg::DS => &self.ds,
            SegReg::ES => &self.es,
            SegReg::FS => &self.fs,
            SegReg::GS => &self.gs,
            SegReg::SS => &self.ss,
        }
    }

    pub fn get_mut(&mut self, r: SegReg) -> &mut Segment {
        match r {
            SegReg::CS => &mut self.cs,
            SegReg::DS => &mut self.ds,
            SegReg::ES => &mut self.es,
            SegReg::FS => &mut self.fs,
            SegReg::GS => &mut self.gs,
            SegReg::SS => &mut self.ss,
        }
    }

    pub fn set(&mut self, r: SegReg, seg: Segment) { *self.get_mut(r) = seg; }
}
