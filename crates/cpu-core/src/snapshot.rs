//! Versioned save/restore of the full processor state.
//!
//! Field order in [`CpuSnapshot`] is the serialized order; reordering or
//! removing a field is a breaking change and needs a new [`SNAPSHOT_VERSION`].

use fpu_simd::X87State;
use serde::{Deserialize, Serialize};

use crate::clock::InterruptLines;
use crate::control::{Cr0, Cr4};
use crate::cpu::Cpu;
use crate::dr::DebugRegs;
use crate::memory::AddressSpace;
use crate::msr::{Msr, MsrMap};
use crate::regs::Gpr;
use crate::segments::{DescriptorTable, Segment};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub version: u32,
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI.
    pub gprs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub interrupt_enable_soon: bool,
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: Segment,
    pub tss: Segment,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub msrs: Vec<(u32, u64)>,
    pub cpl: u8,
    pub lines: u32,
    pub cycles: u64,
    pub fpu: X87State,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
}

impl Cpu {
    /// Capture every field. Pending flags are settled first.
    pub fn save_state(&mut self) -> CpuSnapshot {
        CpuSnapshot {
            version: SNAPSHOT_VERSION,
            gprs: Gpr::ALL.map(|r| self.regs.get(r)),
            eip: self.regs.eip,
            eflags: self.get_eflags(),
            interrupt_enable_soon: self.control.interrupt_enable_soon,
            cs: self.segs.cs,
            ds: self.segs.ds,
            es: self.segs.es,
            fs: self.segs.fs,
            gs: self.segs.gs,
            ss: self.segs.ss,
            gdtr: self.gdtr,
            idtr: self.idtr,
            ldtr: self.ldtr,
            tss: self.tss,
            cr0: self.cr0.bits(),
            cr2: self.cr2,
            cr3: self.cr3,
            cr4: self.cr4.bits(),
            dr: self.dr.raw(),
            msrs: self.msrs.iter().map(|(m, v)| (m.0, v)).collect(),
            cpl: self.cpl,
            lines: self.lines.bits(),
            cycles: self.cycles,
            fpu: self.fpu.clone(),
        }
    }

    /// Restore a snapshot. Control registers are loaded directly and no mode
    /// transition is signalled; the address space is then brought in line
    /// with the restored CR0/CR3/CR4 and CPL.
    pub fn load_state(&mut self, snap: &CpuSnapshot, mem: &mut dyn AddressSpace) -> Result<(), SnapshotError> {
        if snap.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version { found: snap.version, expected: SNAPSHOT_VERSION });
        }
        for (r, v) in Gpr::ALL.into_iter().zip(snap.gprs) {
            self.regs.set(r, v);
        }
        self.regs.eip = snap.eip;
        self.load_eflags_bits(snap.eflags);
        self.control.interrupt_enable_soon = snap.interrupt_enable_soon;
        self.segs.cs = snap.cs;
        self.segs.ds = snap.ds;
        self.segs.es = snap.es;
        self.segs.fs = snap.fs;
        self.segs.gs = snap.gs;
        self.segs.ss = snap.ss;
        self.gdtr = snap.gdtr;
        self.idtr = snap.idtr;
        self.ldtr = snap.ldtr;
        self.tss = snap.tss;
        self.cr0 = Cr0::from_bits_retain(snap.cr0);
        self.cr2 = snap.cr2;
        self.cr3 = snap.cr3;
        self.cr4 = Cr4::from_bits_retain(snap.cr4);
        self.dr = DebugRegs::from_raw(snap.dr);
        self.msrs = snap.msrs.iter().map(|&(m, v)| (Msr(m), v)).collect::<MsrMap>();
        self.lines = InterruptLines::from_bits_retain(snap.lines);
        self.cycles = snap.cycles;
        self.fpu = snap.fpu.clone();
        self.set_cpl(snap.cpl, mem);
        self.sync_address_space(mem);
        Ok(())
    }
}
