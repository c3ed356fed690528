use serde::{Deserialize, Serialize};

/// Processor configuration chosen by the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSet {
    /// Model EFLAGS.AC / CR0.AM alignment checking.
    pub alignment_check: bool,
    /// Family/model/stepping loaded into EDX on reset.
    pub signature: u32,
    /// Clock divisor passed per retired instruction.
    pub instruction_divisor: u32,
    /// Clock divisor passed per halt-loop iteration.
    pub halt_divisor: u32,
    /// Abort a halt after this many iterations; `None` spins until an interrupt.
    pub halt_spin_limit: Option<u64>,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self { alignment_check: true, signature: 0x0000_0633, instruction_divisor: 1, halt_divisor: 1, halt_spin_limit: None }
    }
}
