//! cpu-core: the protection-mode control plane of a 32-bit x86 processor.
//!
//! Segment descriptors, lazily evaluated condition flags, the processor
//! register state, and exception/interrupt delivery across real, protected and
//! virtual-8086 modes. Instruction decoding, paging and device models live
//! outside this crate and meet it through [`memory::AddressSpace`],
//! [`clock::Clock`] and [`clock::InterruptController`].

pub mod clock;
pub mod control;
pub mod cpu;
pub mod dr;
pub mod exceptions;
pub mod feature;
pub mod flags;
pub mod interrupts;
pub mod layout;
pub mod memory;
pub mod mode;
pub mod msr;
pub mod privilege;
pub mod regs;
pub mod segments;
pub mod snapshot;
pub mod tables;
pub mod types;

pub use clock::{Clock, HaltOutcome, InterruptController, InterruptLines};
pub use control::{Cr0, Cr4};
pub use cpu::Cpu;
pub use exceptions::{CpuError, Exception, ExecError, ExecResult, Unimplemented, Vector};
pub use feature::FeatureSet;
pub use flags::{ConditionFlags, EFlags};
pub use interrupts::{handle_exception, handle_hardware_interrupt, handle_software_interrupt, service_interrupts, Origin};
pub use memory::{AddressSpace, FlatMem, SupervisorScope};
pub use mode::{CpuMode, ModeTransition};
pub use regs::{Gpr, RegFile};
pub use segments::{Descriptor, DescriptorError, SegReg, Segment, SegmentKind, SegmentSelector};
pub use snapshot::{CpuSnapshot, SnapshotError, SNAPSHOT_VERSION};
