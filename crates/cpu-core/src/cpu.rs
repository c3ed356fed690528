use fpu_simd::X87State;
use log::{debug, warn};

use crate::clock::{Clock, HaltOutcome, InterruptLines};
use crate::control::{Cr0, Cr4, CR3_PDBR_MASK};
use crate::dr::DebugRegs;
use crate::exceptions::{CpuError, Exception, ExecResult, Unimplemented, Vector};
use crate::feature::FeatureSet;
use crate::flags::{ConditionFlags, ControlFlags, EFlags};
use crate::memory::AddressSpace;
use crate::mode::{CpuMode, ModeTransition};
use crate::msr::{self, Msr, MsrMap};
use crate::privilege::Privilege;
use crate::regs::{Gpr, RegFile};
use crate::segments::{Descriptor, DescriptorTable, ProtectedSegment, SegReg, SegState, Segment, SegmentKind, SegmentSelector};
use crate::tables;

/// Processor state owned by the embedding machine and passed by reference to
/// every operation.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub regs: RegFile,
    pub flags: ConditionFlags,
    pub control: ControlFlags,
    pub segs: SegState,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: Segment,
    pub tss: Segment,
    pub(crate) cr0: Cr0,
    pub(crate) cr2: u32,
    pub(crate) cr3: u32,
    pub(crate) cr4: Cr4,
    pub dr: DebugRegs,
    pub msrs: MsrMap,
    pub(crate) cpl: u8,
    pub(crate) alignment_checking: bool,
    pub lines: InterruptLines,
    pub features: FeatureSet,
    pub fpu: X87State,
    pub(crate) cycles: u64,
}

impl Default for Cpu {
    fn default() -> Self { Self::new(FeatureSet::default()) }
}

impl Cpu {
    pub fn new(features: FeatureSet) -> Self {
        let mut cpu = Self {
            regs: RegFile::default(),
            flags: ConditionFlags::default(),
            control: ControlFlags::default(),
            segs: SegState::default(),
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable::default(),
            ldtr: Segment::Null,
            tss: Segment::Null,
            cr0: Cr0::empty(),
            cr2: 0,
            cr3: 0,
            cr4: Cr4::empty(),
            dr: DebugRegs::default(),
            msrs: MsrMap::default(),
            cpl: 0,
            alignment_checking: false,
            lines: InterruptLines::empty(),
            features,
            fpu: X87State::default(),
            cycles: 0,
        };
        cpu.reset();
        cpu
    }

    /// Architectural power-on state: real mode at F000:FFF0.
    pub fn reset(&mut self) {
        self.regs = RegFile::default();
        self.regs.set(Gpr::EDX, self.features.signature);
        self.regs.eip = 0xFFF0;
        self.flags = ConditionFlags::default();
        self.control = ControlFlags::default();
        self.segs = SegState {
            cs: Segment::real(0xF000),
            ds: Segment::real(0),
            es: Segment::real(0),
            fs: Segment::real(0),
            gs: Segment::real(0),
            ss: Segment::real(0),
        };
        self.gdtr = DescriptorTable::new(0, 0xFFFF);
        self.idtr = DescriptorTable::new(0, 0xFFFF);
        self.ldtr = Segment::Null;
        self.tss = Segment::Null;
        self.cr0 = Cr0::RESET;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = Cr4::empty();
        self.dr = DebugRegs::default();
        self.msrs.clear();
        self.msrs.write(msr::IA32_APIC_BASE, 0xFEE0_0900);
        self.msrs.write(msr::IA32_SYSENTER_CS, 0);
        self.msrs.write(msr::IA32_SYSENTER_ESP, 0);
        self.msrs.write(msr::IA32_SYSENTER_EIP, 0);
        self.cpl = 0;
        self.alignment_checking = false;
        self.lines = InterruptLines::empty();
        self.fpu.fninit();
        self.cycles = 0;
        debug!("cpu reset: cs={:#06x} eip={:#06x}", self.segs.cs.selector(), self.regs.eip);
    }

    /// Push every setting the address space tracks from the current control
    /// registers and CPL. Needed after `reset` and after restoring a snapshot,
    /// since neither goes through the control-register writers.
    pub fn sync_address_space(&self, mem: &mut dyn AddressSpace) {
        mem.set_paging_enabled(self.cr0.contains(Cr0::PG));
        mem.set_page_cache_enabled(!self.cr0.contains(Cr0::CD));
        mem.set_write_protect_user_pages(self.cr0.contains(Cr0::WP));
        mem.set_global_pages_enabled(self.cr4.contains(Cr4::PGE));
        mem.set_page_size_extensions_enabled(self.cr4.contains(Cr4::PSE));
        mem.set_page_directory_base(self.cr3 & CR3_PDBR_MASK);
        mem.set_supervisor(self.cpl != 3);
    }

    pub fn mode(&self) -> CpuMode {
        if !self.is_protected_mode() {
            CpuMode::Real
        } else if self.control.virtual8086() {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    /// Tests only CR0.PE; no other CR0 bit takes part.
    #[inline]
    pub fn is_protected_mode(&self) -> bool { self.cr0.contains(Cr0::PE) }

    #[inline]
    pub fn cpl(&self) -> u8 { self.cpl }
    pub fn cr0(&self) -> Cr0 { self.cr0 }
    pub fn cr2(&self) -> u32 { self.cr2 }
    pub fn cr3(&self) -> u32 { self.cr3 }
    pub fn cr4(&self) -> Cr4 { self.cr4 }
    pub fn set_cr2(&mut self, value: u32) { self.cr2 = value; }
    pub fn alignment_checking(&self) -> bool { self.alignment_checking }
    pub fn cycles(&self) -> u64 { self.cycles }
    pub fn privilege(&self) -> Privilege { Privilege::from_flags(self.cpl, &self.control) }

    /// Change CPL and tell the address space whether accesses are now
    /// supervisor accesses (CPL 0-2).
    pub fn set_cpl(&mut self, cpl: u8, mem: &mut dyn AddressSpace) {
        self.cpl = cpl & 3;
        mem.set_supervisor(self.cpl != 3);
        self.check_alignment_checking();
    }

    /// Assemble EFLAGS from the lazy arithmetic flags and the named control bits.
    pub fn get_eflags(&mut self) -> u32 {
        let c = &self.control;
        let mut f = self.flags.to_eflags() | EFlags::RESERVED1;
        f.set(EFlags::TF, c.trap);
        f.set(EFlags::IF, c.interrupt_enable);
        f.set(EFlags::DF, c.direction);
        f.set(EFlags::NT, c.nested_task);
        f.set(EFlags::RF, c.resume);
        f.set(EFlags::VM, c.virtual8086);
        f.set(EFlags::AC, c.alignment_check);
        f.set(EFlags::VIF, c.virtual_interrupt);
        f.set(EFlags::VIP, c.virtual_interrupt_pending);
        f.set(EFlags::ID, c.id);
        f.with_iopl(c.iopl).bits()
    }

    /// Load every EFLAGS bit. A change of VM is reported as a mode transition;
    /// a change of AC re-evaluates alignment checking.
    pub fn set_eflags(&mut self, value: u32, mem: &mut dyn AddressSpace) -> Option<ModeTransition> {
        let (old_vm, old_ac) = (self.control.virtual8086, self.control.alignment_check);
        self.load_eflags_bits(value);
        if self.control.alignment_check != old_ac {
            self.check_alignment_checking();
        }

        let vm = self.control.virtual8086;
        if !self.is_protected_mode() {
            self.control.virtual8086 = false;
            return None;
        }
        if vm == old_vm {
            return None;
        }
        if vm {
            for r in SegReg::ALL {
                let sel = self.segs.get(r).selector();
                self.segs.set(r, Segment::vm86(sel));
            }
            self.set_cpl(3, mem);
            debug!("mode transition: virtual-8086 (eflags={value:#010x})");
            Some(ModeTransition::ToVirtual8086)
        } else {
            debug!("mode transition: protected (eflags={value:#010x})");
            Some(ModeTransition::ToProtected)
        }
    }

    /// Store every EFLAGS bit without side effects.
    pub(crate) fn load_eflags_bits(&mut self, value: u32) {
        let f = EFlags::from_bits_retain(value);
        self.flags.load_eflags(f);
        let c = &mut self.control;
        c.trap = f.contains(EFlags::TF);
        c.interrupt_enable = f.contains(EFlags::IF);
        c.direction = f.contains(EFlags::DF);
        c.iopl = f.iopl();
        c.nested_task = f.contains(EFlags::NT);
        c.resume = f.contains(EFlags::RF);
        c.virtual8086 = f.contains(EFlags::VM);
        c.alignment_check = f.contains(EFlags::AC);
        c.virtual_interrupt = f.contains(EFlags::VIF);
        c.virtual_interrupt_pending = f.contains(EFlags::VIP);
        c.id = f.contains(EFlags::ID);
    }

    /// Write CR0. Enabling paging without protection, or not-write-through
    /// without cache-disable, is GP(0) and leaves CR0 untouched.
    pub fn set_cr0(&mut self, value: u32, mem: &mut dyn AddressSpace) -> Result<Option<ModeTransition>, Exception> {
        let new = Cr0::from_bits_retain(value) | Cr0::ET;
        if new == self.cr0 {
            return Ok(None);
        }
        if new.contains(Cr0::PG) && !new.contains(Cr0::PE) {
            return Err(Exception::gp(0));
        }
        if new.contains(Cr0::NW) && !new.contains(Cr0::CD) {
            return Err(Exception::gp(0));
        }
        let changed = new ^ self.cr0;
        self.cr0 = new;
        debug!("cr0 <- {:#010x} (changed {:#010x})", new.bits(), changed.bits());

        if changed.contains(Cr0::PG) {
            mem.set_paging_enabled(new.contains(Cr0::PG));
        }
        if changed.contains(Cr0::CD) {
            mem.set_page_cache_enabled(!new.contains(Cr0::CD));
        }
        if changed.contains(Cr0::NW) && new.contains(Cr0::NW) {
            warn!("cr0.nw set; write-back caching is not modeled");
        }
        if changed.contains(Cr0::WP) {
            mem.set_write_protect_user_pages(new.contains(Cr0::WP));
        }
        if changed.contains(Cr0::AM) {
            self.check_alignment_checking();
        }
        if !changed.contains(Cr0::PE) {
            return Ok(None);
        }

        if new.contains(Cr0::PE) {
            for r in SegReg::ALL {
                let seg = *self.segs.get(r);
                self.segs.set(r, Self::to_protected_cache(r, &seg));
            }
            debug!("mode transition: protected");
            Ok(Some(ModeTransition::ToProtected))
        } else {
            self.control.virtual8086 = false;
            self.set_cpl(0, mem);
            for r in SegReg::ALL {
                let sel = self.segs.get(r).selector();
                self.segs.set(r, Segment::real(sel));
            }
            debug!("mode transition: real");
            Ok(Some(ModeTransition::ToReal))
        }
    }

    /// A real-mode segment as the descriptor cache holds it right after CR0.PE
    /// is set: base kept, 64KiB limit, DPL 0.
    fn to_protected_cache(reg: SegReg, seg: &Segment) -> Segment {
        let kind = if reg == SegReg::CS { SegmentKind::ExecuteReadCodeAccessed } else { SegmentKind::ReadWriteDataAccessed };
        let mut fields = Descriptor::segment(kind, seg.base(), 0xFFFF, 0);
        fields.default_size = false;
        Segment::Protected(ProtectedSegment::from_descriptor(seg.selector(), kind, fields))
    }

    pub fn set_cr3(&mut self, value: u32, mem: &mut dyn AddressSpace) {
        self.cr3 = value;
        mem.set_page_directory_base(value & CR3_PDBR_MASK);
        debug!("cr3 <- {value:#010x}");
    }

    /// Write CR4. PAE and VME/PVI are not modeled and end emulation.
    pub fn set_cr4(&mut self, value: u32, mem: &mut dyn AddressSpace) -> Result<(), CpuError> {
        let new = Cr4::from_bits_truncate(value) & Cr4::WRITABLE;
        if new.contains(Cr4::PAE) {
            log::error!("cr4.pae requested: {value:#010x}");
            return Err(Unimplemented::PhysicalAddressExtension.into());
        }
        if new.intersects(Cr4::VME | Cr4::PVI) {
            log::error!("cr4.vme/pvi requested: {value:#010x}");
            return Err(Unimplemented::VirtualModeExtensions.into());
        }
        let changed = new ^ self.cr4;
        self.cr4 = new;
        if changed.contains(Cr4::PSE) {
            mem.set_page_size_extensions_enabled(new.contains(Cr4::PSE));
        }
        if changed.contains(Cr4::PGE) {
            mem.set_global_pages_enabled(new.contains(Cr4::PGE));
        }
        debug!("cr4 <- {:#010x}", new.bits());
        Ok(())
    }

    /// Alignment checks apply only at CPL 3 with CR0.AM and EFLAGS.AC set.
    pub fn check_alignment_checking(&mut self) {
        self.alignment_checking =
            self.features.alignment_check && self.cr0.contains(Cr0::AM) && self.control.alignment_check && self.cpl == 3;
    }

    /// AC(0) for a misaligned `size`-byte access while alignment checking is on.
    pub fn check_alignment(&self, addr: u32, size: u32) -> Result<(), Exception> {
        if self.alignment_checking && size > 1 && addr % size != 0 {
            return Err(Exception::new(Vector::AC, Some(0)));
        }
        Ok(())
    }

    /// Load a data or stack segment register the way MOV/POP Sreg does.
    pub fn load_segment(&mut self, reg: SegReg, selector: u16, mem: &mut dyn AddressSpace) -> ExecResult<()> {
        match self.mode() {
            CpuMode::Real => {
                self.segs.set(reg, Segment::real(selector));
                return Ok(());
            }
            CpuMode::Virtual8086 => {
                self.segs.set(reg, Segment::vm86(selector));
                return Ok(());
            }
            CpuMode::Protected => {}
        }
        if reg == SegReg::CS {
            return Err(Exception::new(Vector::UD, None).into());
        }
        let sel = SegmentSelector(selector);
        let code = sel.masked() as u32;
        if sel.is_null() {
            if reg == SegReg::SS {
                return Err(Exception::gp(0).into());
            }
            self.segs.set(reg, Segment::Null);
            return Ok(());
        }
        let addr = tables::descriptor_address(&self.gdtr, &self.ldtr, sel).ok_or(Exception::gp(code))?;
        let raw = tables::read_descriptor(mem, addr)?;
        let seg = ProtectedSegment::decode(selector, raw)?;
        let b = seg.behavior();

        if reg == SegReg::SS {
            if sel.rpl() != self.cpl || !seg.is_writable_data() || seg.dpl() != self.cpl {
                return Err(Exception::gp(code).into());
            }
            if !seg.present() {
                return Err(Exception::ss(code).into());
            }
        } else {
            if b.system || (b.executable && !b.readable) {
                return Err(Exception::gp(code).into());
            }
            if !(b.executable && b.conforming) && !self.privilege().can_load_data(sel.rpl(), seg.dpl()) {
                return Err(Exception::gp(code).into());
            }
            if !seg.present() {
                return Err(Exception::np(code).into());
            }
        }

        let seg = if seg.kind().type_code() & 1 == 0 {
            let accessed = SegmentKind::from_type_code(seg.kind().type_code() | 1)?;
            tables::write_descriptor_type(mem, addr, accessed)?;
            seg.with_kind(accessed)
        } else {
            seg
        };
        self.segs.set(reg, Segment::Protected(seg));
        Ok(())
    }

    pub fn load_gdtr(&mut self, base: u32, limit: u16) { self.gdtr = DescriptorTable::new(base, limit); }
    pub fn load_idtr(&mut self, base: u32, limit: u16) { self.idtr = DescriptorTable::new(base, limit); }

    /// LLDT.
    pub fn load_ldtr(&mut self, selector: u16, mem: &mut dyn AddressSpace) -> ExecResult<()> {
        self.require_system_load()?;
        let sel = SegmentSelector(selector);
        if sel.is_null() {
            self.ldtr = Segment::Null;
            return Ok(());
        }
        let code = sel.masked() as u32;
        if sel.ti() {
            return Err(Exception::gp(code).into());
        }
        let addr = tables::descriptor_address(&self.gdtr, &Segment::Null, sel).ok_or(Exception::gp(code))?;
        let ldt = ProtectedSegment::decode(selector, tables::read_descriptor(mem, addr)?)?;
        if ldt.kind() != SegmentKind::Ldt {
            return Err(Exception::gp(code).into());
        }
        if !ldt.present() {
            return Err(Exception::np(code).into());
        }
        self.ldtr = Segment::Protected(ldt);
        Ok(())
    }

    /// LTR: load an available TSS and mark it busy in the GDT.
    pub fn load_task_register(&mut self, selector: u16, mem: &mut dyn AddressSpace) -> ExecResult<()> {
        self.require_system_load()?;
        let sel = SegmentSelector(selector);
        if sel.is_null() {
            return Err(Exception::gp(0).into());
        }
        let code = sel.masked() as u32;
        if sel.ti() {
            return Err(Exception::gp(code).into());
        }
        let addr = tables::descriptor_address(&self.gdtr, &Segment::Null, sel).ok_or(Exception::gp(code))?;
        let tss = ProtectedSegment::decode(selector, tables::read_descriptor(mem, addr)?)?;
        let busy = match tss.kind() {
            SegmentKind::Tss16Available => SegmentKind::Tss16Busy,
            SegmentKind::Tss32Available => SegmentKind::Tss32Busy,
            _ => return Err(Exception::gp(code).into()),
        };
        if !tss.present() {
            return Err(Exception::np(code).into());
        }
        tables::write_descriptor_type(mem, addr, busy)?;
        self.tss = Segment::Protected(tss.with_kind(busy));
        Ok(())
    }

    fn require_system_load(&self) -> Result<(), Exception> {
        if self.mode() != CpuMode::Protected {
            return Err(Exception::new(Vector::UD, None));
        }
        if self.cpl != 0 {
            return Err(Exception::gp(0));
        }
        Ok(())
    }

    pub fn read_msr(&self, index: u32) -> Result<u64, Exception> {
        if Msr(index) == msr::IA32_TSC {
            return Ok(self.cycles);
        }
        self.msrs.read(Msr(index)).ok_or(Exception::gp(0))
    }

    pub fn write_msr(&mut self, index: u32, value: u64) {
        if Msr(index) == msr::IA32_TSC {
            self.cycles = value;
        } else {
            self.msrs.write(Msr(index), value);
        }
    }

    /// Account one retired instruction.
    pub fn retire_instruction(&mut self, clock: &mut dyn Clock) {
        self.cycles = self.cycles.wrapping_add(1);
        self.lines |= clock.time_passes(self.features.instruction_divisor);
    }

    /// HLT: spin the clock until a hardware interrupt or reset is pending, or
    /// until `abort` (or the configured spin limit) stops the loop.
    pub fn wait_for_interrupt(&mut self, clock: &mut dyn Clock, abort: &mut dyn FnMut() -> bool) -> HaltOutcome {
        let wake = InterruptLines::HARDWARE_INTERRUPT | InterruptLines::RESET_REQUEST;
        let mut spins = 0u64;
        loop {
            if self.lines.intersects(wake) {
                return HaltOutcome::Interrupted;
            }
            if abort() || self.features.halt_spin_limit.is_some_and(|limit| spins >= limit) {
                debug!("halt aborted after {spins} iterations");
                return HaltOutcome::Aborted;
            }
            self.lines |= clock.time_passes(self.features.halt_divisor);
            spins += 1;
        }
    }

    /// Move EIP back onto the faulting instruction so it re-executes after the
    /// handler returns. Traps are left alone.
    pub fn unwind_faulting_instruction(&mut self, exc: &Exception, instr_len: u32) {
        if !exc.points_to_self {
            return;
        }
        let eip = self.regs.eip.wrapping_sub(instr_len);
        self.regs.eip = if self.segs.cs.default_size() { eip } else { eip & 0xFFFF };
    }

    pub fn raise_interrupt_lines(&mut self, lines: InterruptLines) { self.lines |= lines; }
}
