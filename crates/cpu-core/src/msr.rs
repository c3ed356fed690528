use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Msr(pub u32);

pub const IA32_TSC: Msr = Msr(0x10);
pub const IA32_APIC_BASE: Msr = Msr(0x1B);
pub const IA32_SYSENTER_CS: Msr = Msr(0x174);
pub const IA32_SYSENTER_ESP: Msr = Msr(0x175);
pub const IA32_SYSENTER_EIP: Msr = Msr(0x176);

/// Model-specific registers keyed by index, kept ordered so saved state has a
/// stable layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsrMap {
    map: BTreeMap<u32, u64>,
}

impl MsrMap {
    pub fn read(&self, msr: Msr) -> Option<u64> { self.map.get(&msr.0).copied() }
    pub fn write(&mut self, msr: Msr, val: u64) { self.map.insert(msr.0, val); }
    pub fn clear(&mut self) { self.map.clear(); }
    pub fn iter(&self) -> impl Iterator<Item = (Msr, u64)> + '_ { self.map.iter().map(|(&k, &v)| (Msr(k), v)) }
}

impl FromIterator<(Msr, u64)> for MsrMap {
    fn from_iter<I: IntoIterator<Item = (Msr, u64)>>(iter: I) -> Self {
        Self { map: iter.into_iter().map(|(m, v)| (m.0, v)).collect() }
    }
}
