//! fpu-simd: x87 save-area state carried across resets and snapshots.
//!
//! Only the save/restore contract lives here; no floating-point arithmetic is
//! modeled.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct X87Reg(pub [u8; 10]); // 80-bit

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X87State {
    pub st: [X87Reg; 8],
    pub cw: u16,
    pub sw: u16,
    pub tw: u16,
    pub fip: u32,
    pub fcs: u16,
    pub fdp: u32,
    pub fds: u16,
    pub fop: u16,
}

impl X87State {
    pub const CW_INIT: u16 = 0x037F;
    pub const TW_EMPTY: u16 = 0xFFFF;

    /// FNINIT: control word to defaults, status cleared, all tags empty.
    /// Register contents are left alone.
    pub fn fninit(&mut self) {
        self.cw = Self::CW_INIT;
        self.sw = 0;
        self.tw = Self::TW_EMPTY;
        self.fip = 0;
        self.fcs = 0;
        self.fdp = 0;
        self.fds = 0;
        self.fop = 0;
    }

    /// Top-of-stack index from the status word.
    pub fn top(&self) -> u8 { ((self.sw >> 11) & 0x7) as u8 }
}

impl Default for X87State {
    fn default() -> Self {
        let mut s = Self { st: [X87Reg::default(); 8], cw: 0, sw: 0, tw: 0, fip: 0, fcs: 0, fdp: 0, fds: 0, fop: 0 };
        s.fninit();
        s
    }
}
