//! Kernel image validation and segment walking.
//!
//! Checks the fields this loader depends on before `xmas-elf` is allowed to
//! look at anything else, then exposes the program headers as plain
//! [`Segment`] values. The table is walked with the entry size the image
//! declares, so images with larger entries still parse.

use log::debug;
use xmas_elf::ElfFile;
use xmas_elf::header::{Data, Machine, Type as ElfType};
use xmas_elf::program::{ProgramHeader, Type as PhType};

use crate::error::{BootError, Result};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_OFFSET: usize = 4;
const CLASS_64: u8 = 2;
const PROGRAM_HEADER_64_SIZE: u64 = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub offset: u64,
    pub file_size: u64,
    pub virtual_address: u64,
    pub memory_size: u64,
}

impl Segment {
    pub fn is_loadable(&self) -> bool {
        self.kind == SegmentKind::Load
    }

    pub fn memory_end(&self) -> u64 {
        self.virtual_address + self.memory_size
    }

    fn from_header(ph: ProgramHeader<'_>) -> Self {
        let kind = match ph.get_type() {
            Ok(PhType::Load) => SegmentKind::Load,
            _ => SegmentKind::Other,
        };
        Self {
            kind,
            offset: ph.offset(),
            file_size: ph.file_size(),
            virtual_address: ph.virtual_addr(),
            memory_size: ph.mem_size(),
        }
    }

    fn check(&self, image_len: usize) -> Result<()> {
        if self.memory_size < self.file_size {
            return Err(BootError::MalformedImage(
                "segment memory size is below its file size",
            ));
        }
        match self.offset.checked_add(self.file_size) {
            Some(end) if end <= image_len as u64 => {}
            _ => return Err(BootError::MalformedImage("segment data lies outside the file")),
        }
        if self.virtual_address.checked_add(self.memory_size).is_none() {
            return Err(BootError::MalformedImage("segment wraps the address space"));
        }
        Ok(())
    }
}

/// A kernel image whose header and segment table have been checked.
pub struct KernelImage<'a> {
    elf: ElfFile<'a>,
}

/// Check `bytes` is a 64-bit little-endian x86-64 executable.
///
/// The magic is checked first and nothing past it is read when it is wrong;
/// the class byte comes next, so a 32-bit image is never interpreted with the
/// 64-bit layout.
pub fn validate(bytes: &[u8]) -> Result<KernelImage<'_>> {
    if bytes.len() < ELF_MAGIC.len() || bytes[..ELF_MAGIC.len()] != ELF_MAGIC {
        return Err(BootError::InvalidFormat);
    }
    let class = bytes.get(CLASS_OFFSET).copied().unwrap_or(0);
    if class != CLASS_64 {
        return Err(BootError::UnsupportedClass { class });
    }

    let elf = ElfFile::new(bytes).map_err(BootError::MalformedImage)?;
    if elf.header.pt1.data() != Data::LittleEndian {
        return Err(BootError::UnsupportedTarget("image is not little-endian"));
    }
    if elf.header.pt2.machine().as_machine() != Machine::X86_64 {
        return Err(BootError::UnsupportedTarget("image is not built for x86-64"));
    }
    match elf.header.pt2.type_().as_type() {
        ElfType::Executable => debug!("ELF type = EXEC"),
        ElfType::SharedObject => {
            return Err(BootError::UnsupportedTarget(
                "position-independent images are not supported",
            ));
        }
        _ => return Err(BootError::UnsupportedTarget("image is not an executable")),
    }

    let image = KernelImage { elf };
    image.check_segment_table()?;
    for segment in image.segments().filter(Segment::is_loadable) {
        segment.check(bytes.len())?;
    }
    Ok(image)
}

impl<'a> KernelImage<'a> {
    pub fn entry_point(&self) -> u64 {
        self.elf.header.pt2.entry_point()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.elf.input
    }

    /// Every program header, in table order.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        self.elf.program_iter().map(Segment::from_header)
    }

    pub fn loadable_segments(&self) -> impl Iterator<Item = Segment> + '_ {
        self.segments().filter(Segment::is_loadable)
    }

    fn check_segment_table(&self) -> Result<()> {
        let pt2 = &self.elf.header.pt2;
        let count = pt2.ph_count() as u64;
        let entry_size = pt2.ph_entry_size() as u64;
        let offset = pt2.ph_offset();
        debug!(
            "segment table: offset=0x{:x} entries={} entry_size={}",
            offset, count, entry_size
        );

        if count == 0 {
            return Ok(());
        }
        if offset == 0 {
            return Err(BootError::MalformedImage("segment table offset is zero"));
        }
        if entry_size < PROGRAM_HEADER_64_SIZE {
            return Err(BootError::MalformedImage(
                "segment table entries are smaller than a program header",
            ));
        }
        // Headers are read in place, so they must sit on their natural alignment.
        if offset % 8 != 0 || entry_size % 8 != 0 {
            return Err(BootError::MalformedImage("segment table is misaligned"));
        }
        let end = count
            .checked_mul(entry_size)
            .and_then(|len| len.checked_add(offset));
        match end {
            Some(end) if end <= self.elf.input.len() as u64 => Ok(()),
            _ => Err(BootError::MalformedImage("segment table lies outside the file")),
        }
    }
}
