use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuMode {
    Real,
    Protected,
    Virtual8086,
}

/// One-shot signal returned when a write changes the operating mode. The
/// dispatch loop must stop decoding in the old mode and resume in the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeTransition {
    ToReal,
    ToProtected,
    ToVirtual8086,
}

impl ModeTransition {
    pub fn target(self) -> CpuMode {
        match self {
            ModeTransition::ToReal => CpuMode::Real,
            ModeTransition::ToProtected => CpuMode::Protected,
            ModeTransition::ToVirtual8086 => CpuMode::Virtual8086,
        }
    }
}
