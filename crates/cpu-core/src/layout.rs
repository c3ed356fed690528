//! A minimal flat protected-mode setup: a GDT with ring-0 and ring-3 code and
//! data, a 32-bit TSS holding the ring-0 stack, and an empty IDT.

use crate::cpu::Cpu;
use crate::exceptions::{Exception, ExecResult};
use crate::memory::AddressSpace;
use crate::segments::{Descriptor, ProtectedSegment, SegReg, Segment, SegmentKind, SegmentSelector};
use crate::tables;

pub const KERNEL_CODE: u16 = 0x08;
pub const KERNEL_DATA: u16 = 0x10;
pub const USER_CODE: u16 = 0x18 | 3;
pub const USER_DATA: u16 = 0x20 | 3;
pub const TSS: u16 = 0x28;

const GDT_ENTRIES: u32 = 6;
const TSS32_LIMIT: u32 = 0x67;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatLayout {
    pub gdt_base: u32,
    pub idt_base: u32,
    pub tss_base: u32,
    /// ESP0 stored in the TSS.
    pub kernel_stack: u32,
}

impl Default for FlatLayout {
    fn default() -> Self { Self { gdt_base: 0x1000, idt_base: 0x2000, tss_base: 0x3000, kernel_stack: 0x9000 } }
}

impl FlatLayout {
    /// Write the tables, enter protected mode at CPL 0 and load every segment
    /// register with the kernel selectors.
    pub fn install(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace) -> ExecResult<()> {
        let entries = [
            0,
            Descriptor::flat(SegmentKind::ExecuteReadCode, 0).encode(),
            Descriptor::flat(SegmentKind::ReadWriteData, 0).encode(),
            Descriptor::flat(SegmentKind::ExecuteReadCode, 3).encode(),
            Descriptor::flat(SegmentKind::ReadWriteData, 3).encode(),
            Descriptor::segment(SegmentKind::Tss32Available, self.tss_base, TSS32_LIMIT, 0).encode(),
        ];
        for (i, raw) in entries.iter().enumerate() {
            mem.set_quadword(self.gdt_base + 8 * i as u32, *raw)?;
        }
        for off in (0..=TSS32_LIMIT).step_by(4) {
            mem.set_doubleword(self.tss_base + off, 0)?;
        }
        mem.set_doubleword(self.tss_base + 4, self.kernel_stack)?;
        mem.set_word(self.tss_base + 8, KERNEL_DATA)?;
        for off in (0..256 * 8).step_by(8) {
            mem.set_quadword(self.idt_base + off, 0)?;
        }

        cpu.load_gdtr(self.gdt_base, (GDT_ENTRIES * 8 - 1) as u16);
        cpu.load_idtr(self.idt_base, 256 * 8 - 1);
        let cr0 = cpu.cr0().bits() | crate::control::Cr0::PE.bits();
        cpu.set_cr0(cr0, mem)?;
        cpu.set_cpl(0, mem);
        cpu.segs.cs = self.segment(cpu, mem, KERNEL_CODE)?;
        for reg in [SegReg::SS, SegReg::DS, SegReg::ES, SegReg::FS, SegReg::GS] {
            cpu.load_segment(reg, KERNEL_DATA, mem)?;
        }
        cpu.load_task_register(TSS, mem)?;
        Ok(())
    }

    /// Decode the GDT/LDT entry `selector` names.
    pub fn segment(&self, cpu: &Cpu, mem: &mut dyn AddressSpace, selector: u16) -> ExecResult<Segment> {
        let sel = SegmentSelector(selector);
        let addr = tables::descriptor_address(&cpu.gdtr, &cpu.ldtr, sel).ok_or(Exception::gp(sel.masked() as u32))?;
        let raw = tables::read_descriptor(mem, addr)?;
        Ok(Segment::Protected(ProtectedSegment::decode(selector, raw)?))
    }

    /// Install an IDT entry.
    pub fn set_gate(&self, mem: &mut dyn AddressSpace, vector: u8, kind: SegmentKind, target: u16, offset: u32, dpl: u8) -> Result<(), Exception> {
        let raw = Descriptor::gate(kind, SegmentSelector(target), offset, dpl, true, 0);
        mem.set_quadword(self.idt_base + vector as u32 * 8, raw)
    }

    pub fn set_raw_gate(&self, mem: &mut dyn AddressSpace, vector: u8, raw: u64) -> Result<(), Exception> {
        mem.set_quadword(self.idt_base + vector as u32 * 8, raw)
    }

    /// Drop to CPL 3 on the flat user segments.
    pub fn enter_user(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, eip: u32, esp: u32) -> ExecResult<()> {
        cpu.segs.cs = self.segment(cpu, mem, USER_CODE)?;
        cpu.set_cpl(3, mem);
        for reg in [SegReg::SS, SegReg::DS, SegReg::ES, SegReg::FS, SegReg::GS] {
            cpu.load_segment(reg, USER_DATA, mem)?;
        }
        cpu.regs.eip = eip;
        cpu.regs.set_esp(esp);
        Ok(())
    }
}
