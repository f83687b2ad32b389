//! The firmware session backed by real UEFI boot services.
//!
//! File and allocation services go through the `uefi` crate. The memory-map
//! query and exit-boot-services are issued raw through the system table: the
//! loader has to own the buffer, the map key and the retry policy itself.

use uefi::boot::{self, AllocateType, MemoryType};
use uefi::proto::media::file::{File, FileAttribute, FileInfo, FileMode, RegularFile};
use uefi::{CStr16, Handle, Status};

use bifrost::firmware::{Firmware, MapQuery, Placement};
use bifrost::region::PhysRegion;
use bifrost::{BootError, Result};

use crate::logger;

const MAX_PATH: usize = 128;
const WATCHDOG_CODE: u64 = 0x10000;

pub struct UefiFirmware {
    image: Handle,
}

/// Boot services are gone. Deliberately offers nothing.
pub struct Exited;

impl UefiFirmware {
    pub fn new() -> Self {
        Self {
            image: boot::image_handle(),
        }
    }
}

impl Firmware for UefiFirmware {
    type File = RegularFile;
    type Exited = Exited;

    fn disable_watchdog(&mut self) -> Result<()> {
        boot::set_watchdog_timer(0, WATCHDOG_CODE, None)
            .map_err(|e| BootError::firmware("SetWatchdogTimer", e.status()))
    }

    fn open_file(&mut self, path: &'static str) -> Result<RegularFile> {
        let mut sfs = boot::get_image_file_system(self.image)
            .map_err(|e| BootError::firmware("OpenProtocol SimpleFileSystem", e.status()))?;
        let mut root = sfs
            .open_volume()
            .map_err(|e| BootError::firmware("OpenVolume", e.status()))?;

        let mut buf = [0u16; MAX_PATH];
        let name = CStr16::from_str_with_buf(path, &mut buf)
            .map_err(|_| BootError::firmware("Open kernel file", Status::INVALID_PARAMETER))?;
        let handle = match root.open(name, FileMode::Read, FileAttribute::empty()) {
            Ok(handle) => handle,
            Err(e) if e.status() == Status::NOT_FOUND => {
                return Err(BootError::KernelNotFound { path });
            }
            Err(e) => return Err(BootError::firmware("Open kernel file", e.status())),
        };
        // A directory at the well-known path is as good as no kernel.
        handle
            .into_regular_file()
            .ok_or(BootError::KernelNotFound { path })
    }

    fn file_size(&mut self, file: &mut RegularFile) -> Result<u64> {
        let info = file
            .get_boxed_info::<FileInfo>()
            .map_err(|e| BootError::firmware("GetInfo kernel file", e.status()))?;
        Ok(info.file_size())
    }

    fn read_file(&mut self, file: &mut RegularFile, dst: &mut [u8]) -> Result<usize> {
        file.read(dst)
            .map_err(|e| BootError::firmware("Read kernel file", e.status()))
    }

    fn allocate_pages(&mut self, placement: Placement, pages: usize) -> Result<PhysRegion> {
        let ty = match placement {
            Placement::Anywhere => AllocateType::AnyPages,
            Placement::At(addr) => AllocateType::Address(addr),
        };
        let ptr = boot::allocate_pages(ty, MemoryType::LOADER_DATA, pages)
            .map_err(|e| BootError::firmware("AllocatePages", e.status()))?;
        Ok(unsafe { PhysRegion::identity(ptr, pages * boot::PAGE_SIZE) })
    }

    fn free_pages(&mut self, region: PhysRegion) -> Result<()> {
        let (ptr, pages) = region.into_raw();
        unsafe { boot::free_pages(ptr, pages) }
            .map_err(|e| BootError::firmware("FreePages", e.status()))
    }

    fn allocate_pool(&mut self, bytes: usize) -> Result<PhysRegion> {
        let ptr = boot::allocate_pool(MemoryType::LOADER_DATA, bytes)
            .map_err(|e| BootError::firmware("AllocatePool memory map", e.status()))?;
        Ok(unsafe { PhysRegion::identity(ptr, bytes) })
    }

    fn query_memory_map(&mut self, buffer: &mut [u8]) -> (Status, MapQuery) {
        let mut query = MapQuery {
            map_size: buffer.len(),
            ..MapQuery::default()
        };
        let Some(st) = uefi::table::system_table_raw() else {
            return (Status::UNSUPPORTED, query);
        };
        let status = unsafe {
            let bs = st.as_ref().boot_services;
            ((*bs).get_memory_map)(
                &mut query.map_size,
                buffer.as_mut_ptr().cast(),
                &mut query.map_key,
                &mut query.descriptor_size,
                &mut query.descriptor_version,
            )
        };
        (status, query)
    }

    fn exit_boot_services(self, map_key: usize) -> core::result::Result<Exited, (Self, Status)> {
        // Console output is a boot service; from here on only serial is safe.
        logger::seal();
        let Some(st) = uefi::table::system_table_raw() else {
            return Err((self, Status::UNSUPPORTED));
        };
        let status = unsafe {
            let bs = st.as_ref().boot_services;
            ((*bs).exit_boot_services)(self.image.as_ptr(), map_key)
        };
        if status == Status::SUCCESS {
            Ok(Exited)
        } else {
            Err((self, status))
        }
    }
}

