//! The firmware session the loader runs against.
//!
//! Every firmware service the core needs goes through [`Firmware`]. A session
//! value only exists while boot services do: `exit_boot_services` consumes it,
//! so nothing after the transition can even name a firmware call.

use uefi::Status;

use crate::error::Result;
use crate::region::PhysRegion;

/// Where a page allocation must land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Anywhere,
    At(u64),
}

/// Out-parameters of one memory-map query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapQuery {
    /// Bytes written, or bytes required when the buffer was too small.
    pub map_size: usize,
    pub map_key: usize,
    pub descriptor_size: usize,
    pub descriptor_version: u32,
}

pub trait Firmware: Sized {
    type File;
    /// What is left once boot services are gone.
    type Exited;

    fn disable_watchdog(&mut self) -> Result<()>;

    /// Fails with `KernelNotFound` when `path` does not name a file.
    fn open_file(&mut self, path: &'static str) -> Result<Self::File>;

    fn file_size(&mut self, file: &mut Self::File) -> Result<u64>;

    /// Read from the current position; returns the bytes read.
    fn read_file(&mut self, file: &mut Self::File, dst: &mut [u8]) -> Result<usize>;

    fn allocate_pages(&mut self, placement: Placement, pages: usize) -> Result<PhysRegion>;

    fn free_pages(&mut self, region: PhysRegion) -> Result<()>;

    fn allocate_pool(&mut self, bytes: usize) -> Result<PhysRegion>;

    /// One raw call of the firmware map query into `buffer`.
    fn query_memory_map(&mut self, buffer: &mut [u8]) -> (Status, MapQuery);

    /// Tear down boot services. On failure the session is handed back; the
    /// firmware then only permits another map query and another exit attempt.
    fn exit_boot_services(self, map_key: usize) -> core::result::Result<Self::Exited, (Self, Status)>;
}
