//! Bifrost: the Jotunheim UEFI kernel loader.
//!
//! Loads a statically linked ELF64 kernel from the boot volume to its link
//! addresses, takes the firmware memory map, leaves boot services and enters
//! the kernel. Everything here talks to firmware only through
//! [`firmware::Firmware`], so it is exercised on the host in tests.

#![cfg_attr(not(test), no_std)]

pub mod boot;
pub mod config;
pub mod elf;
pub mod entry;
pub mod error;
pub mod firmware;
pub mod layout;
pub mod loader;
pub mod memmap;
pub mod region;

#[cfg(test)]
mod testing;

pub use boot::{BootStage, Bootstrap, Handoff, boot};
pub use error::{BootError, Result};
