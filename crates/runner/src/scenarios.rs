use anyhow::{Context, Result};
use clap::ValueEnum;
use cpu_core::clock::{QueuedInterrupts, VirtualClock};
use cpu_core::interrupts::{handle_exception, handle_software_interrupt, service_interrupts};
use cpu_core::layout::{self, FlatLayout};
use cpu_core::{Cpu, CpuError, EFlags, Exception, FeatureSet, FlatMem, HaltOutcome, InterruptLines, ModeTransition, SegmentKind};

const MEM_SIZE: usize = 0x10_0000;
const HANDLER: u32 = 0x0004_0000;
const USER_EIP: u32 = 0x0040_1000;
const USER_ESP: u32 = 0x0007_F000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// GP(0) at CPL 3 through a 32-bit interrupt gate to ring 0.
    GpRing3,
    /// GP while delivering GP (the handler gate targets a data segment): a double fault.
    DoubleFault,
    /// Double fault with no usable stack: triple fault.
    TripleFault,
    /// CR0 write with PG set and PE clear.
    PagingWithoutProtection,
    /// INT n from virtual-8086 mode with IOPL 3.
    Vm86Interrupt,
    /// HLT until a timer interrupt arrives, then service it.
    HaltUntilTimer,
}

/// What a scenario left behind.
pub struct Report {
    pub cpu: Cpu,
    pub transitions: Vec<ModeTransition>,
    pub fault: Option<Exception>,
    pub fatal: Option<CpuError>,
    pub halt: Option<HaltOutcome>,
}

impl Report {
    fn new(cpu: Cpu) -> Self { Self { cpu, transitions: Vec::new(), fault: None, fatal: None, halt: None } }

    fn record(&mut self, r: Result<Option<ModeTransition>, CpuError>) {
        match r {
            Ok(t) => self.transitions.extend(t),
            Err(e) => self.fatal = Some(e),
        }
    }
}

fn kernel(features: &FeatureSet) -> Result<(Cpu, FlatMem, FlatLayout)> {
    let mut cpu = Cpu::new(features.clone());
    let mut mem = FlatMem::new(MEM_SIZE);
    let l = FlatLayout::default();
    l.install(&mut cpu, &mut mem).context("installing flat protected-mode tables")?;
    Ok((cpu, mem, l))
}

pub fn run(scenario: Scenario, features: &FeatureSet) -> Result<Report> {
    log::info!("running scenario {scenario:?}");
    match scenario {
        Scenario::GpRing3 => {
            let (mut cpu, mut mem, l) = kernel(features)?;
            l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0)?;
            l.enter_user(&mut cpu, &mut mem, USER_EIP, USER_ESP)?;
            cpu.control.interrupt_enable = true;
            let mut report = Report::new(cpu.clone());
            report.fault = Some(Exception::gp(0));
            report.record(handle_exception(&mut cpu, &mut mem, Exception::gp(0)));
            report.cpu = cpu;
            Ok(report)
        }
        Scenario::DoubleFault => {
            let (mut cpu, mut mem, l) = kernel(features)?;
            l.set_gate(&mut mem, 8, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER + 0x100, 0)?;
            l.set_gate(&mut mem, 13, SegmentKind::InterruptGate32, layout::KERNEL_DATA, HANDLER, 0)?;
            cpu.regs.set_esp(0x8000);
            let mut report = Report::new(cpu.clone());
            report.fault = Some(Exception::gp(0));
            report.record(handle_exception(&mut cpu, &mut mem, Exception::gp(0)));
            report.cpu = cpu;
            Ok(report)
        }
        Scenario::TripleFault => {
            let (mut cpu, mut mem, l) = kernel(features)?;
            l.set_gate(&mut mem, 8, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0)?;
            cpu.regs.set_esp(8);
            let mut report = Report::new(cpu.clone());
            report.fault = Some(Exception::double_fault());
            report.record(handle_exception(&mut cpu, &mut mem, Exception::double_fault()));
            report.cpu = cpu;
            Ok(report)
        }
        Scenario::PagingWithoutProtection => {
            let mut cpu = Cpu::new(features.clone());
            let mut mem = FlatMem::new(MEM_SIZE);
            let mut report = Report::new(cpu.clone());
            match cpu.set_cr0(cpu_core::Cr0::PG.bits(), &mut mem) {
                Ok(t) => report.transitions.extend(t),
                Err(e) => report.fault = Some(e),
            }
            report.cpu = cpu;
            Ok(report)
        }
        Scenario::Vm86Interrupt => {
            let (mut cpu, mut mem, l) = kernel(features)?;
            l.set_gate(&mut mem, 0x21, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 3)?;
            cpu.regs.set_esp(0xFFFE);
            cpu.regs.eip = 0x0100;
            let mut report = Report::new(cpu.clone());
            let eflags = (EFlags::VM | EFlags::IF | EFlags::IOPL0 | EFlags::IOPL1 | EFlags::RESERVED1).bits();
            report.transitions.extend(cpu.set_eflags(eflags, &mut mem));
            report.record(handle_software_interrupt(&mut cpu, &mut mem, 0x21, 2));
            report.cpu = cpu;
            Ok(report)
        }
        Scenario::HaltUntilTimer => {
            let (mut cpu, mut mem, l) = kernel(features)?;
            l.set_gate(&mut mem, 0x20, SegmentKind::InterruptGate32, layout::KERNEL_CODE, HANDLER, 0)?;
            cpu.regs.set_esp(0x8000);
            cpu.control.interrupt_enable = true;
            let mut clock = VirtualClock::new();
            clock.schedule(100, InterruptLines::HARDWARE_INTERRUPT);
            let mut pic = QueuedInterrupts::new(0x27);
            pic.raise(0x20);
            let mut report = Report::new(cpu.clone());
            report.halt = Some(cpu.wait_for_interrupt(&mut clock, &mut || false));
            report.record(service_interrupts(&mut cpu, &mut mem, &mut pic));
            report.cpu = cpu;
            Ok(report)
        }
    }
}
