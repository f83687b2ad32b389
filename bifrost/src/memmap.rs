//! Physical memory map harvesting.
//!
//! The map's size is unknown until the firmware is asked, and asking with a
//! buffer means allocating one, which can itself change the map. So the
//! query runs twice: once with an empty buffer to learn the size, then into a
//! pool buffer with room for a couple of extra descriptors.

use core::mem::size_of;

use log::{debug, info};
use uefi::Status;
use uefi::mem::memory_map::{MemoryDescriptor, MemoryType};

use crate::config::MAP_SLACK_DESCRIPTORS;
use crate::error::{BootError, Result};
use crate::firmware::{Firmware, MapQuery};
use crate::region::PhysRegion;

/// The firmware memory map as handed to the kernel.
///
/// Descriptors are `descriptor_size` bytes apart, which may be larger than
/// `MemoryDescriptor`; always step by the stride.
#[repr(C)]
#[derive(Debug)]
pub struct MemoryMap {
    pub descriptors: *const u8,
    pub map_size: usize,
    pub map_key: usize,
    pub descriptor_size: usize,
    pub descriptor_version: u32,
}

impl MemoryMap {
    pub fn len(&self) -> usize {
        self.map_size / self.descriptor_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = MemoryDescriptor> + '_ {
        (0..self.len()).map(move |i| unsafe {
            self.descriptors
                .add(i * self.descriptor_size)
                .cast::<MemoryDescriptor>()
                .read_unaligned()
        })
    }

    /// Pages of conventional (free after handoff) memory.
    pub fn conventional_pages(&self) -> u64 {
        self.entries()
            .filter(|d| d.ty == MemoryType::CONVENTIONAL)
            .map(|d| d.page_count)
            .sum()
    }
}

/// A harvested map together with the buffer it lives in.
#[derive(Debug)]
pub struct Harvest {
    map: MemoryMap,
    buffer: PhysRegion,
}

impl Harvest {
    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub fn map_key(&self) -> usize {
        self.map.map_key
    }

    /// Query the map again into the buffer already owned. Allocates nothing,
    /// so it is legal after a failed exit-boot-services attempt.
    pub fn refresh<F: Firmware>(&mut self, fw: &mut F) -> Result<()> {
        let (status, query) = fw.query_memory_map(self.buffer.as_mut_slice());
        if status != Status::SUCCESS {
            return Err(BootError::firmware("GetMemoryMap (refresh)", status));
        }
        self.map = package(&self.buffer, query)?;
        debug!("memory map refreshed: key={}", self.map.map_key);
        Ok(())
    }

    /// Hand the map over. The buffer is never freed: the kernel may keep
    /// reading it, and freeing it would invalidate the map key.
    pub fn into_map(self) -> MemoryMap {
        self.map
    }
}

/// Run the two-call query and package the result.
///
/// Nothing may allocate or free firmware memory between this returning and
/// the exit-boot-services call, or the map key goes stale.
pub fn harvest<F: Firmware>(fw: &mut F) -> Result<Harvest> {
    let (status, probe) = fw.query_memory_map(&mut []);
    if status == Status::SUCCESS {
        return Err(BootError::EmptyMemoryMap);
    }
    if status != Status::BUFFER_TOO_SMALL {
        return Err(BootError::firmware("GetMemoryMap (size probe)", status));
    }
    if probe.descriptor_size < size_of::<MemoryDescriptor>() {
        return Err(BootError::MalformedMemoryMap);
    }

    let capacity = probe.map_size + MAP_SLACK_DESCRIPTORS * probe.descriptor_size;
    debug!(
        "memory map needs {} bytes; allocating {}",
        probe.map_size, capacity
    );
    let mut buffer = fw.allocate_pool(capacity)?;

    let (status, query) = fw.query_memory_map(buffer.as_mut_slice());
    if status != Status::SUCCESS {
        return Err(BootError::firmware("GetMemoryMap", status));
    }
    let map = package(&buffer, query)?;
    info!(
        "memory map: {} descriptors, stride {}, version {}, {} conventional pages",
        map.len(),
        map.descriptor_size,
        map.descriptor_version,
        map.conventional_pages()
    );
    Ok(Harvest { map, buffer })
}

fn package(buffer: &PhysRegion, query: MapQuery) -> Result<MemoryMap> {
    if query.descriptor_size < size_of::<MemoryDescriptor>() || query.map_size > buffer.len() {
        return Err(BootError::MalformedMemoryMap);
    }
    Ok(MemoryMap {
        descriptors: buffer.as_ptr(),
        map_size: query.map_size,
        map_key: query.map_key,
        descriptor_size: query.descriptor_size,
        descriptor_version: query.descriptor_version,
    })
}
