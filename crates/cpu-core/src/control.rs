use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct Cr0: u32 {
        const PE = 1<<0;   // Protection Enable
        const MP = 1<<1;   // Monitor Coprocessor
        const EM = 1<<2;   // Emulation
        const TS = 1<<3;   // Task Switched
        const ET = 1<<4;   // Extension Type (hardwired)
        const NE = 1<<5;   // Numeric Error
        const WP = 1<<16;  // Write Protect
        const AM = 1<<18;  // Alignment Mask
        const NW = 1<<29;  // Not Write-through
        const CD = 1<<30;  // Cache Disable
        const PG = 1<<31;  // Paging
    }
}

impl Cr0 {
    /// Value held after power-on and reset.
    pub const RESET: Cr0 = Cr0::CD.union(Cr0::NW).union(Cr0::ET);
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct Cr4: u32 {
        const VME = 1<<0;  // Virtual-8086 Mode Extensions
        const PVI = 1<<1;  // Protected-mode Virtual Interrupts
        const TSD = 1<<2;  // Time Stamp Disable
        const DE  = 1<<3;  // Debugging Extensions
        const PSE = 1<<4;  // Page Size Extensions
        const PAE = 1<<5;  // Physical Address Extension
        const MCE = 1<<6;  // Machine Check Enable
        const PGE = 1<<7;  // Page Global Enable
        const PCE = 1<<8;  // Performance-Monitoring Counter Enable
        const OSFXSR = 1<<9;
        const OSXMMEXCPT = 1<<10;
    }
}

impl Cr4 {
    /// Bits a write to CR4 may change; the rest read as zero.
    pub const WRITABLE: Cr4 = Cr4::all();
}

/// CR3 page-directory base mask.
pub const CR3_PDBR_MASK: u32 = 0xFFFF_F000;
