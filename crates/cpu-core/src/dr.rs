use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugRegs {
    dr: [u32; 8],
}

impl DebugRegs {
    pub const DR6_RESET: u32 = 0xFFFF_0FF0;
    pub const DR7_RESET: u32 = 0x0000_0400;

    /// DR4/DR5 alias DR6/DR7.
    pub fn get(&self, n: usize) -> u32 { self.dr[Self::alias(n)] }
    pub fn set(&mut self, n: usize, val: u32) { self.dr[Self::alias(n)] = val; }
    pub fn raw(&self) -> [u32; 8] { self.dr }
    pub fn from_raw(dr: [u32; 8]) -> Self { Self { dr } }

    fn alias(n: usize) -> usize {
        match n & 7 {
            4 => 6,
            5 => 7,
            n => n,
        }
    }
}

impl Default for DebugRegs {
    fn default() -> Self {
        let mut dr = [0u32; 8];
        dr[6] = Self::DR6_RESET;
        dr[7] = Self::DR7_RESET;
        Self { dr }
    }
}
