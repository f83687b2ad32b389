//! RAM-backed firmware and synthetic kernel images for host tests.

use core::ptr::NonNull;
use uefi::Status;
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType};

use crate::config::PAGE_SIZE;
use crate::error::{BootError, Result};
use crate::firmware::{Firmware, MapQuery, Placement};
use crate::region::PhysRegion;

/// Descriptor stride reported by the mock; larger than `MemoryDescriptor`
/// like most real firmware.
pub const MOCK_STRIDE: usize = 48;

const FILL: u8 = 0xAA;
const ANYWHERE_BASE: u64 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    DisableWatchdog,
    OpenFile(&'static str),
    FileSize,
    ReadFile,
    AllocatePages(Placement, usize),
    FreePages(u64),
    AllocatePool(usize),
    QueryMemoryMap,
    ExitBootServices(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    Pages,
    Pool,
}

struct Allocation {
    base: u64,
    kind: Backing,
    storage: Box<[u8]>,
}

pub struct MockFile {
    data: Vec<u8>,
    pos: usize,
}

pub struct MockFirmware {
    files: Vec<(&'static str, Vec<u8>)>,
    reported_size: Option<usize>,
    read_chunk: usize,
    regions: Vec<MemoryDescriptor>,
    stride: usize,
    growth: usize,
    probe_status: Option<Status>,
    exit_status: Option<Status>,
    stale_exits: usize,
    query_limit: Option<usize>,
    queries: usize,
    free_status: Option<Status>,
    map_key: usize,
    placement_skew: u64,
    occupied: Vec<u64>,
    live: Vec<Allocation>,
    next_anywhere: u64,
    allocations: usize,
    exit_attempts: usize,
    calls: Vec<Call>,
}

/// What the mock leaves behind after a successful exit. Keeps the backing
/// storage alive so regions and the map stay readable.
pub struct ExitedMock {
    pub calls: Vec<Call>,
    pub exit_attempts: usize,
    pub final_key: usize,
    _live: Vec<Allocation>,
}

impl MockFirmware {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            reported_size: None,
            read_chunk: usize::MAX,
            regions: Vec::new(),
            stride: MOCK_STRIDE,
            growth: 1,
            probe_status: None,
            exit_status: None,
            stale_exits: 0,
            query_limit: None,
            queries: 0,
            free_status: None,
            map_key: 1,
            placement_skew: 0,
            occupied: Vec::new(),
            live: Vec::new(),
            next_anywhere: ANYWHERE_BASE,
            allocations: 0,
            exit_attempts: 0,
            calls: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: &'static str, data: Vec<u8>) -> Self {
        self.files.push((path, data));
        self
    }

    /// Report a file size that differs from the stored data.
    pub fn with_reported_size(mut self, size: usize) -> Self {
        self.reported_size = Some(size);
        self
    }

    pub fn with_read_chunk(mut self, chunk: usize) -> Self {
        self.read_chunk = chunk;
        self
    }

    pub fn with_region(mut self, ty: MemoryType, phys_start: u64, page_count: u64) -> Self {
        self.regions.push(descriptor(ty, phys_start, page_count));
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Descriptors added to the map by each pool allocation.
    pub fn with_map_growth(mut self, growth: usize) -> Self {
        self.growth = growth;
        self
    }

    /// Status returned by the size probe instead of the real outcome.
    pub fn with_probe_status(mut self, status: Status) -> Self {
        self.probe_status = Some(status);
        self
    }

    pub fn with_exit_status(mut self, status: Status) -> Self {
        self.exit_status = Some(status);
        self
    }

    /// Reject this many exit attempts as if the map changed underneath.
    pub fn with_stale_exits(mut self, count: usize) -> Self {
        self.stale_exits = count;
        self
    }

    /// Answer only this many memory-map queries; later ones fail.
    pub fn with_map_queries(mut self, limit: usize) -> Self {
        self.query_limit = Some(limit);
        self
    }

    /// Fail every page free with this status.
    pub fn with_free_status(mut self, status: Status) -> Self {
        self.free_status = Some(status);
        self
    }

    /// Grant pinned allocations this many bytes above the requested address.
    pub fn with_placement_skew(mut self, skew: u64) -> Self {
        self.placement_skew = skew;
        self
    }

    /// Mark a page as unavailable for pinned allocations.
    pub fn with_occupied(mut self, addr: u64) -> Self {
        self.occupied.push(addr);
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations
    }

    pub fn live_page_allocations(&self) -> usize {
        self.live.iter().filter(|a| a.kind == Backing::Pages).count()
    }

    pub fn map_key(&self) -> usize {
        self.map_key
    }

    /// Something else in firmware changed the map.
    pub fn bump_map_key(&mut self) {
        self.map_key += 1;
    }

    fn track(&mut self, base: u64, len: usize, kind: Backing) -> PhysRegion {
        let mut storage = vec![FILL; len].into_boxed_slice();
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        self.live.push(Allocation {
            base,
            kind,
            storage,
        });
        self.allocations += 1;
        self.bump_map_key();
        unsafe { PhysRegion::shadowed(base, ptr, len) }
    }

    fn take_anywhere(&mut self, len: usize) -> u64 {
        let base = self.next_anywhere;
        self.next_anywhere += (len as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        base
    }
}

impl Firmware for MockFirmware {
    type File = MockFile;
    type Exited = ExitedMock;

    fn disable_watchdog(&mut self) -> Result<()> {
        self.calls.push(Call::DisableWatchdog);
        Ok(())
    }

    fn open_file(&mut self, path: &'static str) -> Result<MockFile> {
        self.calls.push(Call::OpenFile(path));
        self.files
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, data)| MockFile {
                data: data.clone(),
                pos: 0,
            })
            .ok_or(BootError::KernelNotFound { path })
    }

    fn file_size(&mut self, file: &mut MockFile) -> Result<u64> {
        self.calls.push(Call::FileSize);
        Ok(self.reported_size.unwrap_or(file.data.len()) as u64)
    }

    fn read_file(&mut self, file: &mut MockFile, dst: &mut [u8]) -> Result<usize> {
        self.calls.push(Call::ReadFile);
        let remaining = &file.data[file.pos..];
        let n = dst.len().min(self.read_chunk).min(remaining.len());
        dst[..n].copy_from_slice(&remaining[..n]);
        file.pos += n;
        Ok(n)
    }

    fn allocate_pages(&mut self, placement: Placement, pages: usize) -> Result<PhysRegion> {
        self.calls.push(Call::AllocatePages(placement, pages));
        let len = pages * PAGE_SIZE as usize;
        let base = match placement {
            Placement::Anywhere => self.take_anywhere(len),
            Placement::At(addr) => {
                let end = addr + len as u64;
                if self.occupied.iter().any(|&o| (addr..end).contains(&o)) {
                    return Err(BootError::firmware("AllocatePages", Status::NOT_FOUND));
                }
                addr + self.placement_skew
            }
        };
        Ok(self.track(base, len, Backing::Pages))
    }

    fn free_pages(&mut self, region: PhysRegion) -> Result<()> {
        self.calls.push(Call::FreePages(region.base()));
        if let Some(status) = self.free_status {
            return Err(BootError::firmware("FreePages", status));
        }
        let Some(index) = self.live.iter().position(|a| {
            a.kind == Backing::Pages && a.base == region.base() && a.storage.as_ptr() == region.as_ptr()
        }) else {
            return Err(BootError::firmware("FreePages", Status::INVALID_PARAMETER));
        };
        self.live.swap_remove(index);
        self.bump_map_key();
        Ok(())
    }

    fn allocate_pool(&mut self, bytes: usize) -> Result<PhysRegion> {
        self.calls.push(Call::AllocatePool(bytes));
        let base = self.take_anywhere(bytes);
        for _ in 0..self.growth {
            self.regions.push(descriptor(MemoryType::LOADER_DATA, base, 1));
        }
        Ok(self.track(base, bytes, Backing::Pool))
    }

    fn query_memory_map(&mut self, buffer: &mut [u8]) -> (Status, MapQuery) {
        self.calls.push(Call::QueryMemoryMap);
        self.queries += 1;
        let query = MapQuery {
            map_size: self.regions.len() * self.stride,
            map_key: self.map_key,
            descriptor_size: self.stride,
            descriptor_version: MemoryDescriptor::VERSION,
        };
        if self.query_limit.is_some_and(|limit| self.queries > limit) {
            return (Status::DEVICE_ERROR, query);
        }
        if buffer.is_empty() {
            if let Some(status) = self.probe_status {
                return (status, query);
            }
        }
        if buffer.len() < query.map_size {
            return (Status::BUFFER_TOO_SMALL, query);
        }
        buffer[..query.map_size].fill(0);
        for (i, desc) in self.regions.iter().enumerate() {
            let slot = buffer[i * self.stride..].as_mut_ptr().cast::<MemoryDescriptor>();
            unsafe { slot.write_unaligned(*desc) };
        }
        (Status::SUCCESS, query)
    }

    fn exit_boot_services(mut self, map_key: usize) -> core::result::Result<ExitedMock, (Self, Status)> {
        self.calls.push(Call::ExitBootServices(map_key));
        self.exit_attempts += 1;
        if let Some(status) = self.exit_status {
            return Err((self, status));
        }
        if self.stale_exits > 0 {
            self.stale_exits -= 1;
            self.bump_map_key();
            return Err((self, Status::INVALID_PARAMETER));
        }
        if map_key != self.map_key {
            return Err((self, Status::INVALID_PARAMETER));
        }
        Ok(ExitedMock {
            calls: self.calls,
            exit_attempts: self.exit_attempts,
            final_key: map_key,
            _live: self.live,
        })
    }
}

fn descriptor(ty: MemoryType, phys_start: u64, page_count: u64) -> MemoryDescriptor {
    MemoryDescriptor {
        ty,
        phys_start,
        virt_start: 0,
        page_count,
        att: MemoryAttribute::WRITE_BACK,
    }
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const PT_LOAD: u32 = 1;

struct PendingSegment {
    ty: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Builds little ELF64 images: header, program header table, then segment
/// data in table order.
pub struct ImageBuilder {
    entry: u64,
    class: u8,
    machine: u16,
    object_type: u16,
    entry_size: usize,
    table_offset: Option<u64>,
    segments: Vec<PendingSegment>,
}

impl ImageBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            class: 2,
            machine: 0x3E,
            object_type: 2,
            entry_size: PHDR_SIZE,
            table_offset: None,
            segments: Vec::new(),
        }
    }

    pub fn load(mut self, vaddr: u64, data: &[u8], memsz: u64) -> Self {
        self.segments.push(PendingSegment {
            ty: PT_LOAD,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    pub fn other(mut self, ty: u32, data: &[u8]) -> Self {
        self.segments.push(PendingSegment {
            ty,
            vaddr: 0,
            data: data.to_vec(),
            memsz: data.len() as u64,
        });
        self
    }

    pub fn class(mut self, class: u8) -> Self {
        self.class = class;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn object_type(mut self, object_type: u16) -> Self {
        self.object_type = object_type;
        self
    }

    pub fn entry_size(mut self, size: usize) -> Self {
        self.entry_size = size;
        self
    }

    /// Override the table offset written to the header; the table itself
    /// still goes right after the header.
    pub fn segment_table_offset(mut self, offset: u64) -> Self {
        self.table_offset = Some(offset);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let table_len = self.segments.len() * self.entry_size;
        let mut out = vec![0u8; EHDR_SIZE + table_len];

        out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = self.class;
        out[5] = 1; // little-endian
        out[6] = 1;
        put(&mut out, 16, &self.object_type.to_le_bytes());
        put(&mut out, 18, &self.machine.to_le_bytes());
        put(&mut out, 20, &1u32.to_le_bytes());
        put(&mut out, 24, &self.entry.to_le_bytes());
        let phoff = self.table_offset.unwrap_or(EHDR_SIZE as u64);
        put(&mut out, 32, &phoff.to_le_bytes());
        put(&mut out, 52, &(EHDR_SIZE as u16).to_le_bytes());
        put(&mut out, 54, &(self.entry_size as u16).to_le_bytes());
        put(&mut out, 56, &(self.segments.len() as u16).to_le_bytes());
        put(&mut out, 58, &64u16.to_le_bytes());

        for (i, seg) in self.segments.iter().enumerate() {
            while out.len() % 16 != 0 {
                out.push(0);
            }
            let offset = out.len() as u64;
            out.extend_from_slice(&seg.data);

            let mut ph = [0u8; PHDR_SIZE];
            ph[0..4].copy_from_slice(&seg.ty.to_le_bytes());
            ph[4..8].copy_from_slice(&5u32.to_le_bytes());
            ph[8..16].copy_from_slice(&offset.to_le_bytes());
            ph[16..24].copy_from_slice(&seg.vaddr.to_le_bytes());
            ph[24..32].copy_from_slice(&seg.vaddr.to_le_bytes());
            ph[32..40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
            ph[40..48].copy_from_slice(&seg.memsz.to_le_bytes());
            ph[48..56].copy_from_slice(&0x1000u64.to_le_bytes());

            let slot = EHDR_SIZE + i * self.entry_size;
            let n = PHDR_SIZE.min(self.entry_size);
            out[slot..slot + n].copy_from_slice(&ph[..n]);
        }
        out
    }
}

fn put(out: &mut [u8], at: usize, bytes: &[u8]) {
    out[at..at + bytes.len()].copy_from_slice(bytes);
}
