use cpu_core::layout::{self, FlatLayout};
use cpu_core::{handle_exception, Cpu, Exception, FeatureSet, FlatMem, SegmentKind};

fn main() -> anyhow::Result<()> {
    let mut cpu = Cpu::new(FeatureSet::default());
    let mut mem = FlatMem::new(0x10_0000);
    let flat = FlatLayout::default();
    flat.install(&mut cpu, &mut mem)?;
    flat.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, 0x4_0000, 0)?;
    flat.enter_user(&mut cpu, &mut mem, 0x40_1000, 0x7_F000)?;

    handle_exception(&mut cpu, &mut mem, Exception::gp(0))?;
    println!("cpl={} eip={:#x} esp={:#x}", cpu.cpl(), cpu.regs.eip, cpu.regs.esp());
    println!("error code on stack: {:#x}", cpu_core::AddressSpace::get_doubleword(&mut mem, cpu.regs.esp())?);
    Ok(())
}
