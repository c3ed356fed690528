//! Reads from the GDT, LDT, IDT and TSS. Every access goes through a
//! supervisor scope so user-mode page protection never applies to system
//! tables.

use crate::exceptions::Exception;
use crate::memory::{AddressSpace, SupervisorScope};
use crate::segments::{DescriptorTable, ProtectedSegment, Segment, SegmentKind, SegmentSelector};

/// Linear address of the descriptor `selector` names, or `None` when it lies
/// beyond the GDT/LDT limit (or TI=1 with no LDT loaded).
pub fn descriptor_address(gdtr: &DescriptorTable, ldtr: &Segment, selector: SegmentSelector) -> Option<u32> {
    let offset = selector.index() as u32 * 8;
    if selector.ti() {
        let ldt = ldtr.as_protected().filter(|l| l.kind() == SegmentKind::Ldt)?;
        (offset + 7 <= ldt.limit()).then(|| ldt.base().wrapping_add(offset))
    } else {
        gdtr.contains(offset).then(|| gdtr.base.wrapping_add(offset))
    }
}

pub fn read_descriptor(mem: &mut dyn AddressSpace, addr: u32) -> Result<u64, Exception> {
    SupervisorScope::new(mem).get_quadword(addr)
}

/// Rewrite the type field of the descriptor at `addr` (accessed / busy bits).
pub fn write_descriptor_type(mem: &mut dyn AddressSpace, addr: u32, kind: SegmentKind) -> Result<(), Exception> {
    let mut mem = SupervisorScope::new(mem);
    let access = mem.get_byte(addr.wrapping_add(5))?;
    mem.set_byte(addr.wrapping_add(5), (access & !0x1F) | kind.type_code())
}

/// Gate descriptor for `vector`, or `None` when it lies beyond the IDT limit.
pub fn read_idt_gate(mem: &mut dyn AddressSpace, idtr: &DescriptorTable, vector: u8) -> Result<Option<u64>, Exception> {
    let offset = vector as u32 * 8;
    if !idtr.contains(offset) {
        return Ok(None);
    }
    read_descriptor(mem, idtr.base.wrapping_add(offset)).map(Some)
}

/// Real-mode interrupt vector table entry as `(cs, ip)`.
pub fn read_ivt_entry(mem: &mut dyn AddressSpace, idtr: &DescriptorTable, vector: u8) -> Result<Option<(u16, u16)>, Exception> {
    let offset = vector as u32 * 4;
    if offset + 3 > idtr.limit as u32 {
        return Ok(None);
    }
    let addr = idtr.base.wrapping_add(offset);
    let ip = mem.get_word(addr)?;
    let cs = mem.get_word(addr.wrapping_add(2))?;
    Ok(Some((cs, ip)))
}

/// Privileged stack `(ss, esp)` for `dpl` from a TSS. A 32-bit TSS stores
/// ESPn at `4 + 8n` and SSn at `8 + 8n`; a 16-bit TSS stores SPn at `2 + 4n`
/// and SSn at `4 + 4n`. `None` when the slot lies beyond the TSS limit.
pub fn tss_stack(mem: &mut dyn AddressSpace, tss: &ProtectedSegment, dpl: u8) -> Result<Option<(SegmentSelector, u32)>, Exception> {
    let dpl = dpl as u32;
    let (sp_off, ss_off) = if tss.kind().is_32bit_tss() { (4 + 8 * dpl, 8 + 8 * dpl) } else { (2 + 4 * dpl, 4 + 4 * dpl) };
    if ss_off + 1 > tss.limit() {
        return Ok(None);
    }
    let mut mem = SupervisorScope::new(mem);
    let sp = if tss.kind().is_32bit_tss() {
        mem.get_doubleword(tss.base().wrapping_add(sp_off))?
    } else {
        mem.get_word(tss.base().wrapping_add(sp_off))? as u32
    };
    let ss = mem.get_word(tss.base().wrapping_add(ss_off))?;
    Ok(Some((SegmentSelector(ss), sp)))
}
