// `log` backend: every record goes to serial, and to the firmware console
// while boot services are alive. Formats straight into the sinks; never
// allocates.
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};

use crate::serial;

static LOGGER: BootLogger = BootLogger;
static FIRMWARE_LIVE: AtomicBool = AtomicBool::new(false);

struct BootLogger;

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial::write_fmt(format_args!("[{}] {}\r\n", record.level(), record.args()));
        if FIRMWARE_LIVE.load(Ordering::Acquire) {
            uefi::system::with_stdout(|out| {
                let _ = writeln!(out, "[{}] {}", record.level(), record.args());
            });
        }
    }

    fn flush(&self) {}
}

pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
    FIRMWARE_LIVE.store(true, Ordering::Release);
}

/// Stop using the firmware console. Called right before the first
/// exit-boot-services attempt and never undone.
pub fn seal() {
    FIRMWARE_LIVE.store(false, Ordering::Release);
}

pub fn firmware_live() -> bool {
    FIRMWARE_LIVE.load(Ordering::Acquire)
}
