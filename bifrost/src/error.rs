use core::fmt;

use uefi::Status;

pub type Result<T> = core::result::Result<T, BootError>;

/// Everything that can stop the loader. None of these are recoverable: the
/// caller reports and halts. The exception is a stale map key, which
/// `boot` retries a bounded number of times before surfacing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    FirmwareCallFailed {
        operation: &'static str,
        status: Status,
    },
    KernelNotFound {
        path: &'static str,
    },
    /// Missing ELF magic.
    InvalidFormat,
    /// ELF class byte other than 64-bit.
    UnsupportedClass {
        class: u8,
    },
    UnsupportedTarget(&'static str),
    MalformedImage(&'static str),
    /// No loadable segment with a non-zero memory size.
    EmptyImage,
    ShortRead {
        expected: usize,
        read: usize,
    },
    PlacementMismatch {
        requested: u64,
        granted: u64,
    },
    EntryOutsideImage {
        entry: u64,
    },
    /// The size probe of the memory map succeeded with an empty buffer.
    EmptyMemoryMap,
    MalformedMemoryMap,
    MapTokenStale {
        attempts: usize,
    },
    /// The kernel pages are not reachable at their link address, so there is
    /// nothing safe to jump to.
    KernelNotIdentityMapped {
        base: u64,
    },
}

impl BootError {
    pub fn firmware(operation: &'static str, status: Status) -> Self {
        BootError::FirmwareCallFailed { operation, status }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::FirmwareCallFailed { operation, status } => {
                write!(f, "{operation} failed: {status:?}")
            }
            BootError::KernelNotFound { path } => {
                write!(f, "kernel could not be found at {path}")
            }
            BootError::InvalidFormat => f.write_str("kernel is not a valid ELF file"),
            BootError::UnsupportedClass { class } => {
                write!(f, "kernel is not 64 bit (ELF class {class})")
            }
            BootError::UnsupportedTarget(why) => write!(f, "unsupported kernel image: {why}"),
            BootError::MalformedImage(why) => write!(f, "malformed kernel image: {why}"),
            BootError::EmptyImage => f.write_str("kernel has no loadable segment"),
            BootError::ShortRead { expected, read } => {
                write!(f, "short read of kernel file: {read} of {expected} bytes")
            }
            BootError::PlacementMismatch { requested, granted } => write!(
                f,
                "kernel pages requested at 0x{requested:x} but granted at 0x{granted:x}"
            ),
            BootError::EntryOutsideImage { entry } => {
                write!(f, "entry point 0x{entry:x} lies outside the loaded image")
            }
            BootError::EmptyMemoryMap => {
                f.write_str("first memory map query succeeded (memory map is empty?)")
            }
            BootError::MalformedMemoryMap => {
                f.write_str("firmware reported a descriptor stride below the descriptor size")
            }
            BootError::MapTokenStale { attempts } => {
                write!(f, "memory map key still stale after {attempts} exit attempts")
            }
            BootError::KernelNotIdentityMapped { base } => {
                write!(f, "kernel image at 0x{base:x} is not identity-mapped; not entering it")
            }
        }
    }
}

impl core::error::Error for BootError {}
