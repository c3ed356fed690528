//! Exception and interrupt delivery.
//!
//! Every event, whether a fault raised by execution, an `INT n`, or a vector
//! from the interrupt controller, funnels into [`ExceptionDispatcher::follow_exception`].
//! Delivery validates the gate, the target code segment and any new stack,
//! writes the return frame, and only then commits registers. A fault raised
//! along the way rolls the processor back and is reclassified: a second
//! contributory or page fault becomes a double fault, and a fault while
//! delivering a double fault is a triple fault.

use log::{error, trace, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{InterruptController, InterruptLines};
use crate::cpu::Cpu;
use crate::exceptions::{CpuError, Exception, ExceptionClass, ExecError, ExecResult, Unimplemented};
use crate::flags::ControlFlags;
use crate::memory::{AddressSpace, SupervisorScope};
use crate::mode::{CpuMode, ModeTransition};
use crate::segments::{ProtectedSegment, Segment, SegmentKind};
use crate::tables;

/// Where an event came from. Decides the EXT bit of error codes, whether the
/// gate DPL is checked, and which EIP is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Fault,
    /// `INT n`; EIP still addresses the instruction.
    Software { instr_len: u32 },
    Hardware,
}

impl Origin {
    /// EXT: set for events not caused by an `INT n` instruction.
    pub fn ext(self) -> u32 {
        match self {
            Origin::Software { .. } => 0,
            Origin::Fault | Origin::Hardware => 1,
        }
    }

    pub fn is_software(self) -> bool { matches!(self, Origin::Software { .. }) }
}

/// An event in flight through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub vector: u8,
    pub error_code: Option<u32>,
    pub origin: Origin,
    /// Classification used when a second fault arrives; only faults carry one.
    pub class: ExceptionClass,
}

impl Event {
    pub fn fault(exc: Exception) -> Self {
        Self { vector: exc.vector.number(), error_code: exc.error_code, origin: Origin::Fault, class: exc.vector.class() }
    }

    pub fn software(vector: u8, instr_len: u32) -> Self {
        Self { vector, error_code: None, origin: Origin::Software { instr_len }, class: ExceptionClass::Benign }
    }

    pub fn hardware(vector: u8) -> Self {
        Self { vector, error_code: None, origin: Origin::Hardware, class: ExceptionClass::Benign }
    }

    /// Error code to push; only faults push one.
    fn pushed_error_code(&self) -> Option<u32> {
        match self.origin {
            Origin::Fault => self.error_code,
            _ => None,
        }
    }

    fn return_eip(&self, eip: u32) -> u32 {
        match self.origin {
            Origin::Software { instr_len } => eip.wrapping_add(instr_len),
            _ => eip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    SamePrivilege,
    InnerPrivilege,
    FromVirtual8086,
}

/// Free stack bytes required before a frame is written, per gate width and
/// transfer kind, as `[without error code, with error code]`.
const STACK_SPACE: [(bool, Transfer, [u32; 2]); 5] = [
    (false, Transfer::SamePrivilege, [6, 8]),
    (false, Transfer::InnerPrivilege, [10, 12]),
    (true, Transfer::SamePrivilege, [12, 16]),
    (true, Transfer::InnerPrivilege, [20, 24]),
    (true, Transfer::FromVirtual8086, [36, 40]),
];

/// `None` for 16-bit gates entered from virtual-8086 mode.
pub fn required_stack_space(gate32: bool, transfer: Transfer, error_code: bool) -> Option<u32> {
    STACK_SPACE.iter().find(|(w, t, _)| *w == gate32 && *t == transfer).map(|(_, _, need)| need[error_code as usize])
}

/// SP of zero means a full, wrapped stack and always has room.
fn check_stack_space(sp: u32, need: u32) -> Result<(), Exception> {
    if sp != 0 && sp < need {
        return Err(Exception::ss(0));
    }
    Ok(())
}

/// Push `values` in order below `esp` and return the new ESP. 16-bit stacks
/// wrap within 64KiB and keep ESP's upper half. A slot outside `ss` is
/// SS(`fault_code`).
fn push_frame(mem: &mut dyn AddressSpace, ss: &Segment, esp: u32, stack32: bool, gate32: bool, values: &[u32], fault_code: u32) -> Result<u32, Exception> {
    let size = if gate32 { 4 } else { 2 };
    let mut sp = esp;
    for &v in values {
        sp = sp.wrapping_sub(size);
        if !stack32 {
            sp &= 0xFFFF;
        }
        let lin = ss.translate(sp).map_err(|_| Exception::ss(fault_code))?;
        if gate32 {
            mem.set_doubleword(lin, v)?;
        } else {
            mem.set_word(lin, v as u16)?;
        }
    }
    Ok(if stack32 { sp } else { (esp & 0xFFFF_0000) | sp })
}

/// State restored when delivery faults part-way.
struct Rollback {
    esp: u32,
    eip: u32,
    cs: Segment,
    ss: Segment,
    cpl: u8,
    control: ControlFlags,
}

impl Rollback {
    fn capture(cpu: &Cpu) -> Self {
        Self { esp: cpu.regs.esp(), eip: cpu.regs.eip, cs: cpu.segs.cs, ss: cpu.segs.ss, cpl: cpu.cpl(), control: cpu.control }
    }

    fn restore(self, cpu: &mut Cpu, mem: &mut dyn AddressSpace) {
        cpu.regs.set_esp(self.esp);
        cpu.regs.eip = self.eip;
        cpu.segs.cs = self.cs;
        cpu.segs.ss = self.ss;
        cpu.control = self.control;
        cpu.set_cpl(self.cpl, mem);
    }
}

/// Per-mode delivery. The three entry points share one follow loop.
pub trait ExceptionDispatcher {
    /// Deliver one event. Faults are returned to the follow loop, never handled here.
    fn deliver(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, event: &Event) -> ExecResult<Option<ModeTransition>>;

    fn handle_exception(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, exc: Exception) -> Result<Option<ModeTransition>, CpuError> {
        self.follow_exception(cpu, mem, Event::fault(exc))
    }

    fn handle_software_interrupt(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, vector: u8, instr_len: u32) -> Result<Option<ModeTransition>, CpuError> {
        self.follow_exception(cpu, mem, Event::software(vector, instr_len))
    }

    fn handle_hardware_interrupt(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, vector: u8) -> Result<Option<ModeTransition>, CpuError> {
        self.follow_exception(cpu, mem, Event::hardware(vector))
    }

    fn follow_exception(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, event: Event) -> Result<Option<ModeTransition>, CpuError> {
        let mut event = event;
        loop {
            trace!("deliver vector {:#04x} ({:?}) error={:?} cpl={}", event.vector, event.origin, event.error_code, cpu.cpl());
            let saved = Rollback::capture(cpu);
            let fault = match self.deliver(cpu, mem, &event) {
                Ok(transition) => return Ok(transition),
                Err(ExecError::Fatal(e)) => {
                    error!("fatal while delivering vector {:#04x}: {e}", event.vector);
                    return Err(e);
                }
                Err(ExecError::Exception(fault)) => fault,
            };
            saved.restore(cpu, mem);
            if event.class == ExceptionClass::DoubleFault {
                error!("triple fault: {fault} while delivering a double fault");
                return Err(CpuError::TripleFault);
            }
            event = if event.class.escalates_with(fault.vector.class()) {
                warn!("double fault: {fault} while delivering vector {:#04x}", event.vector);
                Event::fault(Exception::double_fault())
            } else {
                Event::fault(fault)
            };
        }
    }
}

pub struct RealModeDispatcher;
pub struct ProtectedModeDispatcher;
pub struct Virtual8086Dispatcher;

pub fn dispatcher_for(mode: CpuMode) -> &'static dyn ExceptionDispatcher {
    match mode {
        CpuMode::Real => &RealModeDispatcher,
        CpuMode::Protected => &ProtectedModeDispatcher,
        CpuMode::Virtual8086 => &Virtual8086Dispatcher,
    }
}

/// Deliver a fault raised by execution.
pub fn handle_exception(cpu: &mut Cpu, mem: &mut dyn AddressSpace, exc: Exception) -> Result<Option<ModeTransition>, CpuError> {
    dispatcher_for(cpu.mode()).handle_exception(cpu, mem, exc)
}

/// Deliver `INT n`. EIP addresses the instruction; the pushed return address
/// is `EIP + instr_len`.
pub fn handle_software_interrupt(cpu: &mut Cpu, mem: &mut dyn AddressSpace, vector: u8, instr_len: u32) -> Result<Option<ModeTransition>, CpuError> {
    dispatcher_for(cpu.mode()).handle_software_interrupt(cpu, mem, vector, instr_len)
}

pub fn handle_hardware_interrupt(cpu: &mut Cpu, mem: &mut dyn AddressSpace, vector: u8) -> Result<Option<ModeTransition>, CpuError> {
    dispatcher_for(cpu.mode()).handle_hardware_interrupt(cpu, mem, vector)
}

/// Instruction-boundary check of the interrupt lines. A reset request resets
/// the processor; a hardware interrupt is taken when IF is set, outside an
/// STI shadow, asking the controller for exactly one vector.
pub fn service_interrupts(cpu: &mut Cpu, mem: &mut dyn AddressSpace, pic: &mut dyn InterruptController) -> Result<Option<ModeTransition>, CpuError> {
    if cpu.lines.contains(InterruptLines::RESET_REQUEST) {
        let was = cpu.mode();
        cpu.reset();
        cpu.sync_address_space(mem);
        return Ok((was != CpuMode::Real).then_some(ModeTransition::ToReal));
    }
    if cpu.control.interrupt_enable_soon {
        cpu.control.interrupt_enable_soon = false;
        cpu.control.interrupt_enable = true;
        return Ok(None);
    }
    if !cpu.control.interrupt_enable || !cpu.lines.contains(InterruptLines::HARDWARE_INTERRUPT) {
        return Ok(None);
    }
    cpu.lines.remove(InterruptLines::HARDWARE_INTERRUPT);
    let vector = pic.cpu_get_interrupt();
    handle_hardware_interrupt(cpu, mem, vector)
}

impl ExceptionDispatcher for RealModeDispatcher {
    fn deliver(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, event: &Event) -> ExecResult<Option<ModeTransition>> {
        let (cs, ip) = tables::read_ivt_entry(mem, &cpu.idtr, event.vector)?.ok_or(Exception::gp(0))?;
        let esp = cpu.regs.esp();
        check_stack_space(esp & 0xFFFF, 6)?;
        let flags = cpu.get_eflags();
        let frame = [flags, cpu.segs.cs.selector() as u32, event.return_eip(cpu.regs.eip) & 0xFFFF];
        let ss = cpu.segs.ss;
        let esp = push_frame(mem, &ss, esp, false, false, &frame, 0)?;

        cpu.regs.set_esp(esp);
        cpu.segs.cs = Segment::real(cs);
        cpu.regs.eip = ip as u32;
        let c = &mut cpu.control;
        c.interrupt_enable = false;
        c.trap = false;
        c.alignment_check = false;
        c.resume = false;
        cpu.check_alignment_checking();
        Ok(None)
    }
}

impl ExceptionDispatcher for ProtectedModeDispatcher {
    fn deliver(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, event: &Event) -> ExecResult<Option<ModeTransition>> {
        deliver_through_gate(cpu, mem, event)
    }
}

impl ExceptionDispatcher for Virtual8086Dispatcher {
    fn deliver(&self, cpu: &mut Cpu, mem: &mut dyn AddressSpace, event: &Event) -> ExecResult<Option<ModeTransition>> {
        if event.origin.is_software() && !cpu.privilege().vm86_sensitive_allowed() {
            return Err(Exception::gp(0).into());
        }
        deliver_through_gate(cpu, mem, event)
    }
}

/// Protected-mode and virtual-8086 delivery through an interrupt or trap gate.
fn deliver_through_gate(cpu: &mut Cpu, mem: &mut dyn AddressSpace, event: &Event) -> ExecResult<Option<ModeTransition>> {
    let ext = event.origin.ext();
    let from_vm86 = cpu.mode() == CpuMode::Virtual8086;
    if event.origin == Origin::Fault && event.class == ExceptionClass::PageFault {
        cpu.set_cr2(mem.last_walked_address());
    }

    let gate_code = event.vector as u32 * 8 + 2 + ext;
    let raw = tables::read_idt_gate(mem, &cpu.idtr, event.vector)?.ok_or(Exception::gp(gate_code))?;
    let gate = ProtectedSegment::decode(event.vector as u16 * 8, raw)?;
    match gate.kind() {
        SegmentKind::TaskGate => {
            error!("vector {:#04x} routes through a task gate", event.vector);
            return Err(Unimplemented::TaskGate.into());
        }
        k if k.is_interrupt_gate() || k.is_trap_gate() => {}
        _ => return Err(Exception::gp(gate_code).into()),
    }
    if event.origin.is_software() && gate.dpl() < cpu.cpl() {
        return Err(Exception::gp(gate_code).into());
    }
    if !gate.present() {
        return Err(Exception::np(gate_code).into());
    }

    let target_sel = gate.target_selector();
    if target_sel.is_null() {
        return Err(Exception::gp(ext).into());
    }
    let target_code = target_sel.masked() as u32 + ext;
    let addr = tables::descriptor_address(&cpu.gdtr, &cpu.ldtr, target_sel).ok_or(Exception::gp(target_code))?;
    let mut target = ProtectedSegment::decode(target_sel.0, tables::read_descriptor(mem, addr)?)?;
    if !target.is_code() || target.dpl() > cpu.cpl() {
        return Err(Exception::gp(target_code).into());
    }
    if !target.present() {
        return Err(Exception::np(target_code).into());
    }
    let entry = gate.target_offset();
    if entry > target.limit() {
        return Err(Exception::gp(0).into());
    }
    if from_vm86 && (target.is_conforming() || target.dpl() != 0) {
        return Err(Exception::gp(target_code).into());
    }

    let gate32 = gate.kind().is_32bit_gate();
    let error_code = event.pushed_error_code();
    let return_eip = event.return_eip(cpu.regs.eip);
    let eflags = cpu.get_eflags();
    let cpl = cpu.cpl();
    let old_cs = cpu.segs.cs.selector() as u32;

    let new_cpl = if !target.is_conforming() && target.dpl() < cpl {
        let dpl = target.dpl();
        let transfer = if from_vm86 { Transfer::FromVirtual8086 } else { Transfer::InnerPrivilege };
        let need = required_stack_space(gate32, transfer, error_code.is_some()).ok_or(Unimplemented::Vm86Gate16)?;

        let tss = cpu.tss.as_protected().filter(|t| t.kind().is_tss()).copied().ok_or(Exception::ts(ext))?;
        let tss_code = tss.selector().masked() as u32 + ext;
        let (ss_sel, new_esp) = tables::tss_stack(mem, &tss, dpl)?.ok_or(Exception::ts(tss_code))?;
        if ss_sel.is_null() {
            return Err(Exception::ts(ext).into());
        }
        let ss_code = ss_sel.masked() as u32 + ext;
        if ss_sel.rpl() != dpl {
            return Err(Exception::ts(ss_code).into());
        }
        let ss_addr = tables::descriptor_address(&cpu.gdtr, &cpu.ldtr, ss_sel).ok_or(Exception::ts(ss_code))?;
        let new_ss = ProtectedSegment::decode(ss_sel.0, tables::read_descriptor(mem, ss_addr)?)?;
        if new_ss.dpl() != dpl || !new_ss.is_writable_data() {
            return Err(Exception::ts(ss_code).into());
        }
        if !new_ss.present() {
            return Err(Exception::ss(ss_code).into());
        }
        let stack32 = new_ss.default_size();
        check_stack_space(if stack32 { new_esp } else { new_esp & 0xFFFF }, need)?;

        let mut frame = Vec::with_capacity(10);
        if from_vm86 {
            let s = &cpu.segs;
            frame.extend([s.gs.selector(), s.fs.selector(), s.ds.selector(), s.es.selector()].map(u32::from));
        }
        frame.extend([cpu.segs.ss.selector() as u32, cpu.regs.esp(), eflags, old_cs, return_eip]);
        frame.extend(error_code);
        let new_ss = Segment::Protected(new_ss);
        let esp = push_frame(&mut *SupervisorScope::new(mem), &new_ss, new_esp, stack32, gate32, &frame, ss_code)?;

        cpu.segs.ss = new_ss;
        cpu.regs.set_esp(esp);
        if from_vm86 {
            cpu.segs.ds = Segment::Null;
            cpu.segs.es = Segment::Null;
            cpu.segs.fs = Segment::Null;
            cpu.segs.gs = Segment::Null;
        }
        dpl
    } else {
        let ss = cpu.segs.ss;
        let stack32 = ss.default_size();
        let esp = cpu.regs.esp();
        let need = required_stack_space(gate32, Transfer::SamePrivilege, error_code.is_some()).ok_or(Unimplemented::Vm86Gate16)?;
        check_stack_space(if stack32 { esp } else { esp & 0xFFFF }, need)?;

        let mut frame = vec![eflags, old_cs, return_eip];
        frame.extend(error_code);
        let esp = if cpl < 3 {
            push_frame(&mut *SupervisorScope::new(mem), &ss, esp, stack32, gate32, &frame, 0)?
        } else {
            push_frame(mem, &ss, esp, stack32, gate32, &frame, 0)?
        };
        cpu.regs.set_esp(esp);
        cpl
    };

    target.set_rpl(new_cpl);
    cpu.segs.cs = Segment::Protected(target);
    cpu.regs.eip = entry;
    let c = &mut cpu.control;
    if gate.kind().is_interrupt_gate() {
        c.interrupt_enable = false;
    }
    c.trap = false;
    c.nested_task = false;
    c.virtual8086 = false;
    c.resume = false;
    cpu.set_cpl(new_cpl, mem);
    Ok(from_vm86.then_some(ModeTransition::ToProtected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::QueuedInterrupts;
    use crate::exceptions::Vector;
    use crate::layout::{self, FlatLayout};
    use crate::control::{Cr0, Cr4};
    use crate::memory::{FlatMem, PagingToggles};
    use crate::segments::{Descriptor, SegmentSelector};

    const HANDLER: u32 = 0x0004_0000;

    fn kernel() -> (Cpu, FlatMem, FlatLayout) {
        let mut cpu = Cpu::default();
        let mut mem = FlatMem::new(0x10_0000);
        let l = FlatLayout::default();
        l.install(&mut cpu, &mut mem).unwrap();
        cpu.regs.set_esp(0x8000);
        cpu.regs.eip = 0x1234;
        (cpu, mem, l)
    }

    #[test]
    fn stack_space_table() {
        assert_eq!(required_stack_space(false, Transfer::SamePrivilege, false), Some(6));
        assert_eq!(required_stack_space(false, Transfer::InnerPrivilege, true), Some(12));
        assert_eq!(required_stack_space(true, Transfer::SamePrivilege, true), Some(16));
        assert_eq!(required_stack_space(true, Transfer::InnerPrivilege, false), Some(20));
        assert_eq!(required_stack_space(true, Transfer::FromVirtual8086, true), Some(40));
        assert_eq!(required_stack_space(false, Transfer::FromVirtual8086, false), None);
        assert!(check_stack_space(0, 40).is_ok());
        assert_eq!(check_stack_space(8, 12), Err(Exception::ss(0)));
    }

    #[test]
    fn same_privilege_trap_gate_keeps_if() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x80, SegmentKind::TrapGate32, layout::KERNEL_CODE, HANDLER, 3).unwrap();
        cpu.control.interrupt_enable = true;
        cpu.control.trap = true;
        let t = handle_software_interrupt(&mut cpu, &mut mem, 0x80, 2).unwrap();
        assert_eq!(t, None);
        assert_eq!(cpu.regs.eip, HANDLER);
        assert_eq!(cpu.regs.esp(), 0x8000 - 12);
        assert_eq!(mem.get_doubleword(0x8000 - 12).unwrap(), 0x1236);
        assert_eq!(mem.get_doubleword(0x8000 - 8).unwrap(), layout::KERNEL_CODE as u32);
        assert_eq!(mem.get_doubleword(0x8000 - 4).unwrap() & EFLAGS_IF_TF, EFLAGS_IF_TF);
        assert!(cpu.control.interrupt_enable);
        assert!(!cpu.control.trap);
        assert_eq!(cpu.cpl(), 0);
    }

    const EFLAGS_IF_TF: u32 = (1 << 9) | (1 << 8);

    #[test]
    fn fault_with_error_code_on_16bit_gate() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 13, SegmentKind::InterruptGate16, layout::KERNEL_CODE, 0x0001_5678, 0).unwrap();
        cpu.control.interrupt_enable = true;
        handle_exception(&mut cpu, &mut mem, Exception::gp(0x28)).unwrap();
        assert_eq!(cpu.regs.eip, 0x5678);
        assert_eq!(cpu.regs.esp(), 0x8000 - 8);
        assert_eq!(mem.get_word(0x8000 - 8).unwrap(), 0x28);
        assert_eq!(mem.get_word(0x8000 - 6).unwrap(), 0x1234);
        assert!(!cpu.control.interrupt_enable);
    }

    #[test]
    fn software_interrupt_respects_gate_dpl() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x30, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER + 0x100, 0).unwrap();
        l.enter_user(&mut cpu, &mut mem, 0x40_0000, 0x7_0000).unwrap();
        handle_software_interrupt(&mut cpu, &mut mem, 0x30, 2).unwrap();
        // INT 0x30 from ring 3 through a DPL 0 gate becomes GP(0x30*8+2).
        assert_eq!(cpu.regs.eip, HANDLER + 0x100);
        assert_eq!(cpu.regs.esp(), l.kernel_stack - 24);
        assert_eq!(mem.get_doubleword(l.kernel_stack - 24).unwrap(), 0x30 * 8 + 2);
        assert_eq!(mem.get_doubleword(l.kernel_stack - 20).unwrap(), 0x40_0000);

        // Hardware interrupts ignore the gate DPL.
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x30, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        l.enter_user(&mut cpu, &mut mem, 0x40_0000, 0x7_0000).unwrap();
        handle_hardware_interrupt(&mut cpu, &mut mem, 0x30).unwrap();
        assert_eq!(cpu.regs.eip, HANDLER);
        assert_eq!(cpu.regs.esp(), l.kernel_stack - 20);
    }

    #[test]
    fn missing_gates_fault() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        l.set_gate(&mut mem, 11, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER + 0x10, 0).unwrap();
        l.set_raw_gate(&mut mem, 0x40, Descriptor::gate(SegmentKind::InterruptGate32, SegmentSelector(layout::KERNEL_CODE), HANDLER, 0, false, 0)).unwrap();

        handle_hardware_interrupt(&mut cpu, &mut mem, 0x40).unwrap();
        assert_eq!(cpu.regs.eip, HANDLER + 0x10);
        assert_eq!(mem.get_doubleword(0x8000 - 16).unwrap(), 0x40 * 8 + 2 + 1);

        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        cpu.load_idtr(l.idt_base, 0x20 * 8 - 1);
        handle_hardware_interrupt(&mut cpu, &mut mem, 0x20).unwrap();
        assert_eq!(cpu.regs.eip, HANDLER);
        assert_eq!(mem.get_doubleword(0x8000 - 16).unwrap(), 0x20 * 8 + 2 + 1);
    }

    #[test]
    fn non_gate_descriptor_in_idt_is_gp() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        l.set_raw_gate(&mut mem, 0x21, Descriptor::gate(SegmentKind::CallGate32, SegmentSelector(layout::KERNEL_CODE), HANDLER, 0, true, 0)).unwrap();
        handle_hardware_interrupt(&mut cpu, &mut mem, 0x21).unwrap();
        assert_eq!(mem.get_doubleword(0x8000 - 16).unwrap(), 0x21 * 8 + 3);
    }

    #[test]
    fn task_gate_and_reserved_types_are_fatal() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_raw_gate(&mut mem, 0x22, Descriptor::gate(SegmentKind::TaskGate, SegmentSelector(layout::TSS), 0, 0, true, 0)).unwrap();
        assert_eq!(handle_hardware_interrupt(&mut cpu, &mut mem, 0x22), Err(CpuError::Unimplemented(Unimplemented::TaskGate)));

        l.set_raw_gate(&mut mem, 0x23, 0x0000_8800_0008_0000).unwrap();
        assert!(matches!(handle_hardware_interrupt(&mut cpu, &mut mem, 0x23), Err(CpuError::Descriptor(_))));
    }

    #[test]
    fn page_fault_loads_cr2() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 14, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        let pf = mem.get_byte(0xDEAD_BEEF).unwrap_err();
        handle_exception(&mut cpu, &mut mem, pf).unwrap();
        assert_eq!(cpu.cr2(), 0xDEAD_BEEF);
        assert_eq!(cpu.regs.eip, HANDLER);
    }

    #[test]
    fn short_stack_escalates() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        l.set_gate(&mut mem, 8, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER + 0x80, 0).unwrap();
        cpu.regs.set_esp(12);
        // GP needs 16 bytes; the SS fault during delivery is contributory.
        // The double fault needs 16 bytes as well, so delivery ends in a triple fault.
        assert_eq!(handle_exception(&mut cpu, &mut mem, Exception::gp(0)), Err(CpuError::TripleFault));
        assert_eq!(cpu.regs.esp(), 12);
        assert_eq!(cpu.regs.eip, 0x1234);
    }

    #[test]
    fn real_mode_uses_ivt() {
        let mut cpu = Cpu::default();
        let mut mem = FlatMem::new(0x10_0000);
        cpu.load_idtr(0, 0x3FF);
        mem.set_word(0x21 * 4, 0x0100).unwrap();
        mem.set_word(0x21 * 4 + 2, 0x2000).unwrap();
        cpu.segs.ss = Segment::real(0x3000);
        cpu.regs.set_esp(0x1_0100);
        cpu.segs.cs = Segment::real(0x1000);
        cpu.regs.eip = 0x50;
        cpu.control.interrupt_enable = true;
        cpu.control.alignment_check = true;

        handle_software_interrupt(&mut cpu, &mut mem, 0x21, 2).unwrap();
        assert_eq!(cpu.segs.cs, Segment::real(0x2000));
        assert_eq!(cpu.regs.eip, 0x100);
        assert_eq!(cpu.regs.esp(), 0x1_00FA);
        assert_eq!(mem.get_word(0x30000 + 0xFA).unwrap(), 0x52);
        assert_eq!(mem.get_word(0x30000 + 0xFC).unwrap(), 0x1000);
        assert_eq!(mem.get_word(0x30000 + 0xFE).unwrap() & (1 << 9), 1 << 9);
        assert!(!cpu.control.interrupt_enable);
        assert!(!cpu.control.alignment_check());

        cpu.regs.set_esp(4);
        assert_eq!(handle_hardware_interrupt(&mut cpu, &mut mem, 0x21), Err(CpuError::TripleFault));
    }

    #[test]
    fn vm86_interrupt_switches_to_ring0() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x21, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 3).unwrap();
        l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER + 0x40, 0).unwrap();
        cpu.regs.set_esp(0xFFF0);
        cpu.regs.eip = 0x0100;
        let vm = crate::flags::EFlags::VM.bits() | crate::flags::EFlags::IF.bits() | 0x2;
        assert_eq!(cpu.set_eflags(vm, &mut mem), Some(ModeTransition::ToVirtual8086));
        for (reg, sel) in [(crate::segments::SegReg::CS, 0x1000), (crate::segments::SegReg::SS, 0x2000), (crate::segments::SegReg::DS, 0x3000)] {
            cpu.load_segment(reg, sel, &mut mem).unwrap();
        }

        // IOPL 0: INT n is IOPL-sensitive and becomes GP(0).
        let t = handle_software_interrupt(&mut cpu, &mut mem, 0x21, 2).unwrap();
        assert_eq!(t, Some(ModeTransition::ToProtected));
        assert_eq!(cpu.regs.eip, HANDLER + 0x40);
        let top = l.kernel_stack;
        assert_eq!(cpu.regs.esp(), top - 40);
        assert_eq!(mem.get_doubleword(top - 40).unwrap(), 0);
        assert_eq!(mem.get_doubleword(top - 36).unwrap(), 0x0100);
        assert_eq!(mem.get_doubleword(top - 32).unwrap(), 0x1000);
        assert_eq!(mem.get_doubleword(top - 20).unwrap(), 0x2000);
        assert_eq!(mem.get_doubleword(top - 12).unwrap(), 0x3000);
        assert_eq!(cpu.mode(), CpuMode::Protected);
        assert_eq!(cpu.cpl(), 0);
        assert!(cpu.segs.ds.is_null() && cpu.segs.gs.is_null());
        assert_eq!(cpu.get_eflags() & crate::flags::EFlags::VM.bits(), 0);
    }

    #[test]
    fn vm86_with_iopl3_reaches_gate() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x21, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 3).unwrap();
        let vm = crate::flags::EFlags::VM.bits() | (3 << 12) | 0x2;
        cpu.set_eflags(vm, &mut mem);
        cpu.regs.set_esp(0x100);
        handle_software_interrupt(&mut cpu, &mut mem, 0x21, 2).unwrap();
        assert_eq!(cpu.regs.eip, HANDLER);
        assert_eq!(cpu.regs.esp(), l.kernel_stack - 36);

        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x21, SegmentKind::InterruptGate16, layout::KERNEL_CODE, HANDLER, 3).unwrap();
        cpu.set_eflags(vm, &mut mem);
        assert_eq!(handle_software_interrupt(&mut cpu, &mut mem, 0x21, 2), Err(CpuError::Unimplemented(Unimplemented::Vm86Gate16)));
    }

    #[test]
    fn service_honours_shadow_and_if() {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x20, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        let mut pic = QueuedInterrupts::new(0x27);
        pic.raise(0x20);
        cpu.raise_interrupt_lines(InterruptLines::HARDWARE_INTERRUPT);

        service_interrupts(&mut cpu, &mut mem, &mut pic).unwrap();
        assert_eq!(pic.acknowledged(), 0);

        cpu.control.interrupt_enable_soon = true;
        service_interrupts(&mut cpu, &mut mem, &mut pic).unwrap();
        assert_eq!(pic.acknowledged(), 0);
        assert!(cpu.control.interrupt_enable);

        service_interrupts(&mut cpu, &mut mem, &mut pic).unwrap();
        assert_eq!(pic.acknowledged(), 1);
        assert_eq!(cpu.regs.eip, HANDLER);
        assert!(!cpu.lines.contains(InterruptLines::HARDWARE_INTERRUPT));

        cpu.raise_interrupt_lines(InterruptLines::RESET_REQUEST);
        assert_eq!(service_interrupts(&mut cpu, &mut mem, &mut pic), Ok(Some(ModeTransition::ToReal)));
        assert_eq!(cpu.mode(), CpuMode::Real);
        assert_eq!(cpu.regs.eip, 0xFFF0);
    }

    #[test]
    fn reset_line_returns_address_space_to_defaults() {
        let (mut cpu, mut mem, _) = kernel();
        let on = Cr0::PE | Cr0::PG | Cr0::WP | Cr0::ET;
        cpu.set_cr0(on.bits(), &mut mem).unwrap();
        cpu.set_cr3(0x0005_0000, &mut mem);
        cpu.set_cr4((Cr4::PSE | Cr4::PGE).bits(), &mut mem).unwrap();
        assert!(mem.toggles.paging && mem.toggles.cache && mem.toggles.write_protect);

        let mut pic = QueuedInterrupts::new(0x27);
        cpu.raise_interrupt_lines(InterruptLines::RESET_REQUEST);
        assert_eq!(service_interrupts(&mut cpu, &mut mem, &mut pic), Ok(Some(ModeTransition::ToReal)));
        assert_eq!(cpu.cr0(), Cr0::RESET);
        assert_eq!(mem.toggles, PagingToggles::default());
        assert!(mem.is_supervisor());
    }

    /// Write GDT entry `index`, widening the GDT limit to cover it.
    fn add_descriptor(cpu: &mut Cpu, mem: &mut FlatMem, l: &FlatLayout, index: u16, raw: u64) -> u16 {
        mem.set_quadword(l.gdt_base + index as u32 * 8, raw).unwrap();
        let limit = cpu.gdtr.limit.max(index * 8 + 7);
        cpu.load_gdtr(l.gdt_base, limit);
        index * 8
    }

    /// Ring 3 with a DPL 0 interrupt gate at 0x40 into the kernel code segment.
    fn user_with_gate() -> (Cpu, FlatMem, FlatLayout) {
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 0x40, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0).unwrap();
        l.enter_user(&mut cpu, &mut mem, 0x40_0000, 0x7_F000).unwrap();
        (cpu, mem, l)
    }

    fn deliver_0x40(cpu: &mut Cpu, mem: &mut FlatMem) -> ExecResult<Option<ModeTransition>> {
        deliver_through_gate(cpu, mem, &Event::hardware(0x40))
    }

    fn raised(e: Exception) -> ExecResult<Option<ModeTransition>> { Err(ExecError::Exception(e)) }

    #[test]
    fn conforming_target_stays_at_current_privilege() {
        let (mut cpu, mut mem, l) = kernel();
        let sel = add_descriptor(&mut cpu, &mut mem, &l, 6, Descriptor::flat(SegmentKind::ConformingExecuteReadCode, 0).encode());
        l.set_gate(&mut mem, 0x40, SegmentKind::InterruptGate32, sel, HANDLER, 0).unwrap();
        l.enter_user(&mut cpu, &mut mem, 0x40_0000, 0x7_F000).unwrap();

        assert_eq!(handle_hardware_interrupt(&mut cpu, &mut mem, 0x40), Ok(None));
        assert_eq!(cpu.cpl(), 3);
        assert_eq!(cpu.regs.eip, HANDLER);
        assert_eq!(cpu.regs.esp(), 0x7_F000 - 12);
        assert_eq!(cpu.segs.cs.selector(), sel | 3);
        assert_eq!(cpu.segs.ss.selector(), layout::USER_DATA);
        assert_eq!(mem.get_doubleword(0x7_F000 - 12).unwrap(), 0x40_0000);
        assert_eq!(mem.get_doubleword(0x7_F000 - 8).unwrap(), layout::USER_CODE as u32);
    }

    #[test]
    fn inner_transfer_without_tss_is_ts() {
        let (mut cpu, mut mem, _) = user_with_gate();
        cpu.tss = Segment::Null;
        assert_eq!(deliver_0x40(&mut cpu, &mut mem), raised(Exception::ts(1)));
    }

    #[test]
    fn tss_stack_slot_beyond_limit_is_ts() {
        let (mut cpu, mut mem, l) = user_with_gate();
        let raw = Descriptor::segment(SegmentKind::Tss32Available, l.tss_base, 0x05, 0).encode();
        let sel = add_descriptor(&mut cpu, &mut mem, &l, 6, raw);
        cpu.tss = Segment::Protected(ProtectedSegment::decode(sel, raw).unwrap());
        assert_eq!(deliver_0x40(&mut cpu, &mut mem), raised(Exception::ts(sel as u32 + 1)));
    }

    #[test]
    fn bad_tss_stack_selectors_are_ts() {
        let (mut cpu, mut mem, l) = user_with_gate();
        let cases = [
            (0x00, Exception::ts(1)),
            (layout::KERNEL_DATA | 1, Exception::ts(layout::KERNEL_DATA as u32 + 1)),
            (layout::USER_DATA & !3, Exception::ts((layout::USER_DATA & !3) as u32 + 1)),
            (layout::KERNEL_CODE, Exception::ts(layout::KERNEL_CODE as u32 + 1)),
        ];
        for (ss0, expected) in cases {
            mem.set_word(l.tss_base + 8, ss0).unwrap();
            assert_eq!(deliver_0x40(&mut cpu, &mut mem), raised(expected), "ss0={ss0:#x}");
            assert_eq!(cpu.cpl(), 3);
            assert_eq!(cpu.regs.esp(), 0x7_F000);
        }
    }

    #[test]
    fn absent_tss_stack_segment_is_ss() {
        let (mut cpu, mut mem, l) = user_with_gate();
        let mut absent = Descriptor::flat(SegmentKind::ReadWriteData, 0);
        absent.present = false;
        let sel = add_descriptor(&mut cpu, &mut mem, &l, 6, absent.encode());
        mem.set_word(l.tss_base + 8, sel).unwrap();
        assert_eq!(deliver_0x40(&mut cpu, &mut mem), raised(Exception::ss(sel as u32 + 1)));
    }

    #[test]
    fn new_stack_limit_violation_names_the_stack_selector() {
        let (mut cpu, mut mem, l) = user_with_gate();
        let small = Descriptor::segment(SegmentKind::ReadWriteData, 0, 0x0F, 0);
        let sel = add_descriptor(&mut cpu, &mut mem, &l, 6, small.encode());
        mem.set_word(l.tss_base + 8, sel).unwrap();
        assert_eq!(deliver_0x40(&mut cpu, &mut mem), raised(Exception::ss(sel as u32 + 1)));
        assert_eq!(cpu.regs.esp(), 0x7_F000);
    }

    #[test]
    fn double_fault_classification_drives_follow_loop() {
        // A page fault on the handler stack while delivering a breakpoint is
        // delivered as a plain page fault.
        let (mut cpu, mut mem, l) = kernel();
        l.set_gate(&mut mem, 3, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 3).unwrap();
        l.set_gate(&mut mem, 14, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER + 0x20, 0).unwrap();
        l.set_gate(&mut mem, 8, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER + 0x40, 0).unwrap();
        cpu.regs.set_esp(0x20_0004);
        assert!(!Exception::pf(0).combines_to_double_fault(&Exception::new(Vector::BP, None)));
        assert_eq!(handle_exception(&mut cpu, &mut mem, Exception::new(Vector::BP, None)), Err(CpuError::TripleFault));
        // The page fault itself could not be pushed either: PF on PF is a double
        // fault, and the double fault hits the same stack.
        assert_eq!(cpu.regs.esp(), 0x20_0004);
    }
}
