//! Architectural exceptions, the double-fault classification, and the fatal
//! conditions that stop emulation.

use serde::{Deserialize, Serialize};

use crate::segments::DescriptorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Vector {
    DE = 0,  // Divide Error
    DB = 1,  // Debug
    NMI = 2, // Non-maskable
    BP = 3,  // Breakpoint
    OF = 4,  // Overflow
    BR = 5,  // BOUND Range Exceeded
    UD = 6,  // Invalid Opcode
    NM = 7,  // Device Not Available
    DF = 8,  // Double Fault
    CSO = 9, // Coprocessor Segment Overrun
    TS = 10, // Invalid TSS
    NP = 11, // Segment Not Present
    SS = 12, // Stack Fault
    GP = 13, // General Protection
    PF = 14, // Page Fault
    MF = 16, // x87 FP Exception-Pending
    AC = 17, // Alignment Check
    MC = 18, // Machine Check
    XM = 19, // SIMD FP Exception
}

impl Vector {
    #[inline]
    pub fn number(self) -> u8 { self as u8 }

    /// Faults leave EIP on the faulting instruction; traps leave it after.
    pub fn points_to_self(self) -> bool {
        !matches!(self, Vector::DB | Vector::NMI | Vector::BP | Vector::OF | Vector::MC)
    }

    pub fn class(self) -> ExceptionClass {
        match self {
            Vector::DE | Vector::TS | Vector::NP | Vector::SS | Vector::GP => ExceptionClass::Contributory,
            Vector::PF => ExceptionClass::PageFault,
            Vector::DF => ExceptionClass::DoubleFault,
            _ => ExceptionClass::Benign,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    /// `second` raised while delivering an event of class `self` becomes a
    /// double fault.
    pub fn escalates_with(self, second: ExceptionClass) -> bool {
        use ExceptionClass as C;
        matches!(
            (self, second),
            (C::Contributory, C::Contributory) | (C::Contributory | C::PageFault, C::PageFault) | (C::PageFault, C::Contributory)
        )
    }
}

/// A fault raised by execution or by exception delivery itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{vector:?} (error code {error_code:?})")]
pub struct Exception {
    pub vector: Vector,
    pub error_code: Option<u32>,
    pub points_to_self: bool,
}

impl Exception {
    pub fn new(vector: Vector, error_code: Option<u32>) -> Self {
        Self { vector, error_code, points_to_self: vector.points_to_self() }
    }

    pub fn gp(code: u32) -> Self { Self::new(Vector::GP, Some(code)) }
    pub fn np(code: u32) -> Self { Self::new(Vector::NP, Some(code)) }
    pub fn ss(code: u32) -> Self { Self::new(Vector::SS, Some(code)) }
    pub fn ts(code: u32) -> Self { Self::new(Vector::TS, Some(code)) }
    pub fn pf(code: u32) -> Self { Self::new(Vector::PF, Some(code)) }
    pub fn double_fault() -> Self { Self::new(Vector::DF, Some(0)) }

    /// Whether raising `self` while `original` was being delivered escalates
    /// to a double fault.
    pub fn combines_to_double_fault(&self, original: &Exception) -> bool {
        original.vector.class().escalates_with(self.vector.class())
    }
}

/// Features this core deliberately does not model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Unimplemented {
    #[error("task gates / hardware task switching")] TaskGate,
    #[error("16-bit interrupt or trap gate entered from virtual-8086 mode")] Vm86Gate16,
    #[error("36-bit physical addressing (CR4.PAE)")] PhysicalAddressExtension,
    #[error("virtual-8086 mode extensions (CR4.VME)")] VirtualModeExtensions,
}

/// Conditions that end emulation; the embedder must stop and reset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CpuError {
    #[error("triple fault")]
    TripleFault,
    #[error("unimplemented feature: {0}")]
    Unimplemented(#[from] Unimplemented),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Either an architectural fault, which the dispatcher reclassifies and
/// delivers, or a fatal error that propagates to the embedder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Exception(#[from] Exception),
    #[error(transparent)]
    Fatal(#[from] CpuError),
}

impl From<Unimplemented> for ExecError {
    fn from(u: Unimplemented) -> Self { ExecError::Fatal(CpuError::Unimplemented(u)) }
}

impl From<DescriptorError> for ExecError {
    fn from(e: DescriptorError) -> Self { ExecError::Fatal(CpuError::Descriptor(e)) }
}

pub type ExecResult<T> = Result<T, ExecError>;
