use cpu_core::layout::{self, FlatLayout};
use cpu_core::{Cpu, FeatureSet, FlatMem, SegmentKind};

pub const GP_HANDLER: u32 = 0x0004_0000;
pub const DF_HANDLER: u32 = 0x0004_1000;
pub const USER_EIP: u32 = 0x0040_1000;
pub const USER_ESP: u32 = 0x0007_F000;

pub fn kernel() -> (Cpu, FlatMem, FlatLayout) {
    let mut cpu = Cpu::new(FeatureSet::default());
    let mut mem = FlatMem::new(0x10_0000);
    let l = FlatLayout::default();
    l.install(&mut cpu, &mut mem).unwrap();
    cpu.regs.set_esp(0x8000);
    cpu.regs.eip = 0x1000;
    (cpu, mem, l)
}

pub fn install_df_handler(mem: &mut FlatMem, l: &FlatLayout) {
    l.set_gate(mem, 8, SegmentKind::InterruptGate32, layout::KERNEL_CODE, DF_HANDLER, 0).unwrap();
}
