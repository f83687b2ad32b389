//! The kernel's side of the handoff.
//!
//! Firmware code runs with the Microsoft x64 convention (`efiapi`); the kernel
//! is entered with System V. The conversion happens in exactly one place,
//! [`KernelEntry::call`], through the explicitly tagged [`KernelMain`] type.

use crate::memmap::MemoryMap;

/// Signature of the kernel entry point.
#[cfg(target_arch = "x86_64")]
pub type KernelMain = extern "sysv64" fn(MemoryMap) -> u64;

/// Entry point address taken from a validated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEntry(u64);

impl KernelEntry {
    pub(crate) fn new(address: u64) -> Self {
        Self(address)
    }

    pub fn address(&self) -> u64 {
        self.0
    }

    /// Jump into the kernel with `map` passed by value.
    ///
    /// # Safety
    /// The kernel image must be loaded at its link address in identity-mapped
    /// memory, and boot services must already be gone.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn call(self, map: MemoryMap) -> u64 {
        let main: KernelMain = unsafe { core::mem::transmute(self.0 as usize) };
        main(map)
    }
}
