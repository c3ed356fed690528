use cpu_core::flags::EFlags;
use cpu_core::layout;
use cpu_core::{handle_exception, AddressSpace, CpuError, Cr0, Descriptor, Exception, SegmentKind, SegmentSelector};

use crate::fixtures::*;

#[test]
fn ring3_gp_switches_to_tss_stack() {
    let (mut cpu, mut mem, l) = kernel();
    l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, GP_HANDLER, 0).unwrap();
    l.enter_user(&mut cpu, &mut mem, USER_EIP, USER_ESP).unwrap();
    cpu.control.interrupt_enable = true;
    cpu.control.trap = true;

    assert_eq!(handle_exception(&mut cpu, &mut mem, Exception::gp(0)), Ok(None));

    let top = l.kernel_stack;
    assert_eq!(cpu.cpl(), 0);
    assert_eq!(cpu.regs.eip, GP_HANDLER);
    assert_eq!(cpu.regs.esp(), top - 24);
    assert_eq!(cpu.segs.ss.selector(), layout::KERNEL_DATA);
    assert_eq!(cpu.segs.cs.selector(), layout::KERNEL_CODE);
    assert_eq!(mem.get_doubleword(top - 24).unwrap(), 0);
    assert_eq!(mem.get_doubleword(top - 20).unwrap(), USER_EIP);
    assert_eq!(mem.get_doubleword(top - 16).unwrap(), layout::USER_CODE as u32);
    let pushed = mem.get_doubleword(top - 12).unwrap();
    assert_ne!(pushed & EFlags::IF.bits(), 0);
    assert_ne!(pushed & EFlags::TF.bits(), 0);
    assert_eq!(mem.get_doubleword(top - 8).unwrap(), USER_ESP);
    assert_eq!(mem.get_doubleword(top - 4).unwrap(), layout::USER_DATA as u32);
    assert!(!cpu.control.interrupt_enable);
    assert!(!cpu.control.trap);
}

#[test]
fn gp_during_gp_delivery_is_a_double_fault() {
    let (mut cpu, mut mem, l) = kernel();
    // Present gate whose target is the kernel data segment: delivery raises GP(0x11).
    l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_DATA, GP_HANDLER, 0).unwrap();
    install_df_handler(&mut mem, &l);

    assert_eq!(handle_exception(&mut cpu, &mut mem, Exception::gp(0x10)), Ok(None));
    assert_eq!(cpu.regs.eip, DF_HANDLER);
    assert_eq!(cpu.regs.esp(), 0x8000 - 16);
    assert_eq!(mem.get_doubleword(0x8000 - 16).unwrap(), 0);
    assert_eq!(mem.get_doubleword(0x8000 - 12).unwrap(), 0x1000);
}

#[test]
fn benign_then_contributory_is_delivered_in_turn() {
    let (mut cpu, mut mem, l) = kernel();
    // BP through a present gate whose target is null: GP(EXT) is delivered, not a double fault.
    l.set_gate(&mut mem, 3, SegmentKind::InterruptGate32, 0, GP_HANDLER, 0).unwrap();
    l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, GP_HANDLER, 0).unwrap();
    install_df_handler(&mut mem, &l);

    handle_exception(&mut cpu, &mut mem, Exception::new(cpu_core::Vector::BP, None)).unwrap();
    assert_eq!(cpu.regs.eip, GP_HANDLER);
    assert_eq!(mem.get_doubleword(cpu.regs.esp()).unwrap(), 1);
}

#[test]
fn double_fault_during_double_fault_is_fatal() {
    let (mut cpu, mut mem, l) = kernel();
    let absent = Descriptor::gate(SegmentKind::InterruptGate32, SegmentSelector(layout::KERNEL_CODE), DF_HANDLER, 0, false, 0);
    l.set_raw_gate(&mut mem, 8, absent).unwrap();
    l.set_raw_gate(&mut mem, 13, absent).unwrap();

    assert_eq!(handle_exception(&mut cpu, &mut mem, Exception::gp(0)), Err(CpuError::TripleFault));
    assert_eq!(handle_exception(&mut cpu, &mut mem, Exception::double_fault()), Err(CpuError::TripleFault));
    assert_eq!(cpu.regs.eip, 0x1000);
    assert_eq!(cpu.regs.esp(), 0x8000);
}

#[test]
fn paging_without_protection_is_rejected_unchanged() {
    let mut cpu = cpu_core::Cpu::default();
    let mut mem = cpu_core::FlatMem::new(0x1000);
    let before = cpu.cr0();
    assert_eq!(cpu.set_cr0((before | Cr0::PG).bits(), &mut mem), Err(Exception::gp(0)));
    assert_eq!(cpu.cr0(), before);
    assert_eq!(cpu.mode(), cpu_core::CpuMode::Real);
}
