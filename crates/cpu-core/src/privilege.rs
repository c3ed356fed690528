use crate::flags::ControlFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Privilege {
    pub cpl: u8,
    pub iopl: u8,
}

impl Privilege {
    pub fn from_flags(cpl: u8, flags: &ControlFlags) -> Self {
        Self { cpl, iopl: flags.iopl }
    }

    /// IOPL-sensitive instructions (INT n, CLI, STI, PUSHF...) in virtual-8086 mode.
    pub fn vm86_sensitive_allowed(&self) -> bool { self.iopl == 3 }

    /// Data-segment access rule: the effective privilege `max(CPL, RPL)` must
    /// not exceed the descriptor's DPL.
    pub fn can_load_data(&self, rpl: u8, dpl: u8) -> bool { self.cpl.max(rpl) <= dpl }
}
