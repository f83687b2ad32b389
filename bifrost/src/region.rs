use core::ptr::NonNull;
use core::slice;

use crate::config::PAGE_SIZE;

/// How a region's host pointer relates to the physical range it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// Host pointer == physical address. Firmware identity-maps all memory
    /// while boot services are alive, so every firmware allocation is this.
    Identity,
    /// Backing storage elsewhere that stands in for the physical range.
    Shadowed,
}

/// An owned, contiguous range of physical memory handed out by firmware.
///
/// Dropping a region does not release it; ownership either goes back through
/// `Firmware::free_pages` or passes on to the kernel.
#[derive(Debug)]
pub struct PhysRegion {
    base: u64,
    ptr: NonNull<u8>,
    len: usize,
    mapping: Mapping,
}

impl PhysRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes, exclusively
    /// owned by the new region, and equal to the physical address.
    pub unsafe fn identity(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            base: ptr.as_ptr() as u64,
            ptr,
            len,
            mapping: Mapping::Identity,
        }
    }

    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes and exclusively
    /// owned by the new region for as long as it lives.
    pub unsafe fn shadowed(base: u64, ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            ptr,
            len,
            mapping: Mapping::Shadowed,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    /// Whole pages spanned by the region.
    pub fn pages(&self) -> usize {
        (self.len as u64).div_ceil(PAGE_SIZE) as usize
    }

    pub fn mapping(&self) -> Mapping {
        self.mapping
    }

    pub fn is_identity_mapped(&self) -> bool {
        self.mapping == Mapping::Identity
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Host pointer to the first byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Does `[addr, addr + len)` lie inside the region?
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Bytes backing the target range `[addr, addr + len)`.
    pub fn window(&self, addr: u64, len: u64) -> Option<&[u8]> {
        let start = self.offset_of(addr, len)?;
        Some(&self.as_slice()[start..start + len as usize])
    }

    /// Mutable bytes backing the target range `[addr, addr + len)`.
    pub fn window_mut(&mut self, addr: u64, len: u64) -> Option<&mut [u8]> {
        let start = self.offset_of(addr, len)?;
        Some(&mut self.as_mut_slice()[start..start + len as usize])
    }

    /// Give up the region, returning the host pointer and page count.
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        (self.ptr, self.pages())
    }

    fn offset_of(&self, addr: u64, len: u64) -> Option<usize> {
        if self.contains(addr, len) {
            Some((addr - self.base) as usize)
        } else {
            None
        }
    }
}
