// Build-time settings. Nothing here is read at runtime.

use log::LevelFilter;

/// Well-known location of the kernel on the boot volume.
pub const KERNEL_PATH: &str = r"\EFI\Custom\kernel.elf";

/// Firmware page granularity.
pub const PAGE_SIZE: u64 = uefi::boot::PAGE_SIZE as u64;

/// Extra descriptors of headroom in the memory-map buffer. Allocating the
/// buffer itself may split a free region and grow the map.
pub const MAP_SLACK_DESCRIPTORS: usize = 2;

/// Upper bound on exit-boot-services attempts with a refreshed map key.
pub const MAX_EXIT_ATTEMPTS: usize = 3;

/// How long a fatal message stays on screen before the halt (microseconds).
pub const FATAL_STALL_US: usize = 1_000_000;

pub const LOG_LEVEL: LevelFilter = if cfg!(debug_assertions) {
    LevelFilter::Debug
} else {
    LevelFilter::Info
};
