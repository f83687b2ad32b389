#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

#[cfg(not(target_os = "uefi"))]
fn main() {}

extern crate alloc;

mod logger;
mod serial;
mod uefi_fw;

use log::{error, info, warn};
use uefi::boot;
use uefi::prelude::*;

use bifrost::BootError;
use bifrost::config::{FATAL_STALL_US, KERNEL_PATH, LOG_LEVEL};

use crate::uefi_fw::UefiFirmware;

#[cfg(target_os = "uefi")]
#[global_allocator]
static ALLOCATOR: uefi::allocator::Allocator = uefi::allocator::Allocator;

#[cfg(target_os = "uefi")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    error!("[panic] {}", info);
    halt()
}

/* =================================== Entry =================================== */
#[entry]
fn efi_main() -> Status {
    serial::init();
    serial::write_fmt(format_args!(">>> Bifrost entry\r\n"));

    if uefi::helpers::init().is_err() {
        serial::write_fmt(format_args!("[FATAL] helpers::init failed\r\n"));
        halt();
    }
    logger::init(LOG_LEVEL);
    if let Err(e) = uefi::system::with_stdout(|out| out.clear()) {
        warn!("ClearScreen failed: {:?}", e.status());
    }
    info!("loader start; kernel at {}", KERNEL_PATH);

    let handoff = match bifrost::boot(UefiFirmware::new(), KERNEL_PATH) {
        Ok(handoff) => handoff,
        Err(e) => die(&e),
    };

    // Boot services are gone: logging reaches serial only from here.
    info!("entering kernel at 0x{:x}", handoff.entry.address());
    match unsafe { handoff.enter() } {
        Ok(status) => error!("kernel returned 0x{:x}, this should never happen", status),
        Err(e) => die(&e),
    }
    halt()
}

/* ================== Fatal paths ================== */
#[cold]
fn die(err: &BootError) -> ! {
    error!("[fatal] {}", err);
    if logger::firmware_live() {
        boot::stall(FATAL_STALL_US);
    }
    halt()
}

fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
