use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Gpr {
    EAX = 0,
    ECX = 1,
    EDX = 2,
    EBX = 3,
    ESP = 4,
    EBP = 5,
    ESI = 6,
    EDI = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [Gpr::EAX, Gpr::ECX, Gpr::EDX, Gpr::EBX, Gpr::ESP, Gpr::EBP, Gpr::ESI, Gpr::EDI];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegFile {
    regs: [u32; 8],
    pub eip: u32,
}

impl RegFile {
    #[inline]
    pub fn get(&self, r: Gpr) -> u32 { self.regs[r as usize] }

    #[inline]
    pub fn set(&mut self, r: Gpr, val: u32) { self.regs[r as usize] = val; }

    #[inline]
    pub fn get16(&self, r: Gpr) -> u16 { self.regs[r as usize] as u16 }

    #[inline]
    pub fn set16(&mut self, r: Gpr, val: u16) {
        let idx = r as usize;
        self.regs[idx] = (self.regs[idx] & 0xFFFF_0000) | (val as u32);
    }

    #[inline]
    pub fn get8l(&self, r: Gpr) -> u8 { self.regs[r as usize] as u8 }

    #[inline]
    pub fn set8l(&mut self, r: Gpr, val: u8) {
        let idx = r as usize;
        self.regs[idx] = (self.regs[idx] & 0xFFFF_FF00) | (val as u32);
    }

    #[inline]
    pub fn get8h(&self, r: Gpr) -> u8 { (self.regs[r as usize] >> 8) as u8 }

    #[inline]
    pub fn set8h(&mut self, r: Gpr, val: u8) {
        let idx = r as usize;
        self.regs[idx] = (self.regs[idx] & 0xFFFF_00FF) | ((val as u32) << 8);
    }

    pub fn eax(&self) -> u32 { self.get(Gpr::EAX) }
    pub fn ecx(&self) -> u32 { self.get(Gpr::ECX) }
    pub fn edx(&self) -> u32 { self.get(Gpr::EDX) }
    pub fn ebx(&self) -> u32 { self.get(Gpr::EBX) }
    pub fn esp(&self) -> u32 { self.get(Gpr::ESP) }
    pub fn ebp(&self) -> u32 { self.get(Gpr::EBP) }
    pub fn esi(&self) -> u32 { self.get(Gpr::ESI) }
    pub fn edi(&self) -> u32 { self.get(Gpr::EDI) }

    pub fn set_esp(&mut self, val: u32) { self.set(Gpr::ESP, val) }
}
