use cpu_core::flags::Flag;
use cpu_core::types::Width;
use cpu_core::{Cpu, CpuMode, CpuSnapshot, SNAPSHOT_VERSION};

use crate::fixtures::kernel;

#[test]
fn workspace_smoke_cpu_core() {
    let cpu = Cpu::default();
    assert_eq!(cpu.mode(), CpuMode::Real);
    assert_eq!(cpu.cpl(), 0);
    assert_eq!(cpu.regs.eip, 0xFFF0);
    assert_eq!(cpu.segs.cs.base(), 0xF0000);
}

#[test]
fn lazy_flags_settle_on_read() {
    let mut cpu = Cpu::default();
    cpu.flags.set_add(Width::W32, 0xFFFF_FFFF, 1, 0x1_0000_0000);
    assert!(cpu.flags.is_pending(Flag::Carry));
    assert!(cpu.flags.carry());
    assert!(cpu.flags.zero());
    assert!(!cpu.flags.sign());
    assert!(!cpu.flags.overflow());
    assert!(!cpu.flags.is_pending(Flag::Carry));
    assert_eq!(cpu.get_eflags() & 0x41, 0x41);
}

#[test]
fn protected_state_survives_a_json_snapshot() {
    let (mut cpu, mut mem, _) = kernel();
    cpu.set_cr2(0xCAFE_0000);
    let snap = cpu.save_state();
    assert_eq!(snap.version, SNAPSHOT_VERSION);

    let text = serde_json::to_string(&snap).unwrap();
    let back: CpuSnapshot = serde_json::from_str(&text).unwrap();
    let mut restored = Cpu::default();
    restored.load_state(&back, &mut mem).unwrap();
    assert_eq!(restored.mode(), CpuMode::Protected);
    assert_eq!(restored.cr2(), 0xCAFE_0000);
    assert_eq!(restored.segs.cs, cpu.segs.cs);
    assert_eq!(restored.regs.esp(), 0x8000);
}
