//! The address-space collaborator and a flat implementation of it.

use std::ops::{Deref, DerefMut, Range};

use serde::{Deserialize, Serialize};

use crate::exceptions::Exception;

/// Linear memory as seen by the core.
///
/// Accesses fault with a page fault when translation fails; the address that
/// failed is reported by [`last_walked_address`](AddressSpace::last_walked_address)
/// so the dispatcher can load it into CR2. Paging, caching and write-protect
/// toggles are forwarded here from control-register writes.
pub trait AddressSpace {
    fn get_byte(&mut self, addr: u32) -> Result<u8, Exception>;
    fn set_byte(&mut self, addr: u32, val: u8) -> Result<(), Exception>;

    fn get_word(&mut self, addr: u32) -> Result<u16, Exception> {
        Ok(u16::from_le_bytes([self.get_byte(addr)?, self.get_byte(addr.wrapping_add(1))?]))
    }
    fn set_word(&mut self, addr: u32, val: u16) -> Result<(), Exception> {
        let [b0, b1] = val.to_le_bytes();
        self.set_byte(addr, b0)?;
        self.set_byte(addr.wrapping_add(1), b1)
    }
    fn get_doubleword(&mut self, addr: u32) -> Result<u32, Exception> {
        let lo = self.get_word(addr)? as u32;
        let hi = self.get_word(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }
    fn set_doubleword(&mut self, addr: u32, val: u32) -> Result<(), Exception> {
        self.set_word(addr, val as u16)?;
        self.set_word(addr.wrapping_add(2), (val >> 16) as u16)
    }
    fn get_quadword(&mut self, addr: u32) -> Result<u64, Exception> {
        let lo = self.get_doubleword(addr)? as u64;
        let hi = self.get_doubleword(addr.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }
    fn set_quadword(&mut self, addr: u32, val: u64) -> Result<(), Exception> {
        self.set_doubleword(addr, val as u32)?;
        self.set_doubleword(addr.wrapping_add(4), (val >> 32) as u32)
    }

    /// Whether accesses currently bypass user-level page protection.
    fn is_supervisor(&self) -> bool;
    fn set_supervisor(&mut self, supervisor: bool);

    /// Linear address of the most recent failed translation.
    fn last_walked_address(&self) -> u32 { 0 }

    fn set_paging_enabled(&mut self, _enabled: bool) {}
    fn set_page_cache_enabled(&mut self, _enabled: bool) {}
    fn set_write_protect_user_pages(&mut self, _enabled: bool) {}
    fn set_global_pages_enabled(&mut self, _enabled: bool) {}
    fn set_page_size_extensions_enabled(&mut self, _enabled: bool) {}
    fn set_page_directory_base(&mut self, _cr3: u32) {}
}

/// Forces supervisor access for as long as it lives; the previous setting is
/// restored on drop, on every exit path.
pub struct SupervisorScope<'a, M: AddressSpace + ?Sized> {
    mem: &'a mut M,
    previous: bool,
}

impl<'a, M: AddressSpace + ?Sized> SupervisorScope<'a, M> {
    pub fn new(mem: &'a mut M) -> Self {
        let previous = mem.is_supervisor();
        mem.set_supervisor(true);
        Self { mem, previous }
    }
}

impl<M: AddressSpace + ?Sized> Deref for SupervisorScope<'_, M> {
    type Target = M;
    fn deref(&self) -> &M { self.mem }
}

impl<M: AddressSpace + ?Sized> DerefMut for SupervisorScope<'_, M> {
    fn deref_mut(&mut self) -> &mut M { self.mem }
}

impl<M: AddressSpace + ?Sized> Drop for SupervisorScope<'_, M> {
    fn drop(&mut self) { self.mem.set_supervisor(self.previous); }
}

/// Paging-related toggles last forwarded by the processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingToggles {
    pub paging: bool,
    pub cache: bool,
    pub write_protect: bool,
    pub global_pages: bool,
    pub page_size_extensions: bool,
    pub page_directory_base: u32,
}

/// Identity-mapped RAM. Ranges marked supervisor-only fault user accesses the
/// way a page with U/S clear would.
#[derive(Clone, Serialize, Deserialize)]
pub struct FlatMem {
    data: Vec<u8>,
    supervisor: bool,
    supervisor_only: Vec<Range<u32>>,
    last_fault: u32,
    pub toggles: PagingToggles,
}

const PF_PRESENT: u32 = 1 << 0;
const PF_WRITE: u32 = 1 << 1;
const PF_USER: u32 = 1 << 2;

impl FlatMem {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0u8; size], supervisor: false, supervisor_only: Vec::new(), last_fault: 0, toggles: PagingToggles::default() }
    }

    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Deny non-supervisor access to `range`.
    pub fn protect(&mut self, range: Range<u32>) { self.supervisor_only.push(range); }

    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Exception> {
        let a = addr as usize;
        match a.checked_add(bytes.len()) {
            Some(end) if end <= self.data.len() => {
                self.data[a..end].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(self.fault(addr, true, false)),
        }
    }

    fn fault(&mut self, addr: u32, write: bool, present: bool) -> Exception {
        self.last_fault = addr;
        let mut code = 0;
        if present { code |= PF_PRESENT; }
        if write { code |= PF_WRITE; }
        if !self.supervisor { code |= PF_USER; }
        Exception::pf(code)
    }

    fn check(&mut self, addr: u32, write: bool) -> Result<usize, Exception> {
        let a = addr as usize;
        if a >= self.data.len() {
            return Err(self.fault(addr, write, false));
        }
        if !self.supervisor && self.supervisor_only.iter().any(|r| r.contains(&addr)) {
            return Err(self.fault(addr, write, true));
        }
        Ok(a)
    }
}

impl AddressSpace for FlatMem {
    fn get_byte(&mut self, addr: u32) -> Result<u8, Exception> {
        let a = self.check(addr, false)?;
        Ok(self.data[a])
    }

    fn set_byte(&mut self, addr: u32, val: u8) -> Result<(), Exception> {
        let a = self.check(addr, true)?;
        self.data[a] = val;
        Ok(())
    }

    fn is_supervisor(&self) -> bool { self.supervisor }
    fn set_supervisor(&mut self, supervisor: bool) { self.supervisor = supervisor; }
    fn last_walked_address(&self) -> u32 { self.last_fault }

    fn set_paging_enabled(&mut self, enabled: bool) { self.toggles.paging = enabled; }
    fn set_page_cache_enabled(&mut self, enabled: bool) { self.toggles.cache = enabled; }
    fn set_write_protect_user_pages(&mut self, enabled: bool) { self.toggles.write_protect = enabled; }
    fn set_global_pages_enabled(&mut self, enabled: bool) { self.toggles.global_pages = enabled; }
    fn set_page_size_extensions_enabled(&mut self, enabled: bool) { self.toggles.page_size_extensions = enabled; }
    fn set_page_directory_base(&mut self, cr3: u32) { self.toggles.page_directory_base = cr3; }
}
