use serde::{Deserialize, Serialize};

/// Operand width of an arithmetic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    pub fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u64 { 1 << (self.bits() - 1) }
}
