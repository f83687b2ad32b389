//! Reading the kernel off the boot volume and placing its segments.

use log::{debug, info, warn};

use crate::config::PAGE_SIZE;
use crate::elf::{self, KernelImage};
use crate::entry::KernelEntry;
use crate::error::{BootError, Result};
use crate::firmware::{Firmware, Placement};
use crate::layout::LoadPlan;
use crate::region::{Mapping, PhysRegion};

/// A kernel copied to its link addresses and ready to be entered.
#[derive(Debug)]
pub struct LoadedKernel {
    pub entry: KernelEntry,
    pub plan: LoadPlan,
    /// Pages backing the image; they belong to the kernel from here on.
    pub image: PhysRegion,
}

/// Read, validate and place the kernel at `path`.
///
/// The raw file buffer is released before returning; the pages the segments
/// were copied into are not.
pub fn load_kernel<F: Firmware>(fw: &mut F, path: &'static str) -> Result<LoadedKernel> {
    let raw = read_image(fw, path)?;
    let loaded = {
        elf::validate(raw.as_slice()).and_then(|image| {
            let plan = LoadPlan::plan(image.loadable_segments())?;
            materialize(fw, &plan, &image)
        })
    };
    // A failed load is the error worth reporting; a failed free only after.
    match (loaded, fw.free_pages(raw)) {
        (Ok(kernel), Ok(())) => {
            debug!("raw kernel buffer released");
            Ok(kernel)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), freed) => {
            if let Err(free_err) = freed {
                warn!("raw kernel buffer not released: {}", free_err);
            }
            Err(e)
        }
    }
}

fn read_image<F: Firmware>(fw: &mut F, path: &'static str) -> Result<PhysRegion> {
    let mut file = fw.open_file(path)?;
    let size = fw.file_size(&mut file)? as usize;
    info!("kernel bytes = {}", size);
    if size == 0 {
        return Err(BootError::InvalidFormat);
    }

    let pages = (size as u64).div_ceil(PAGE_SIZE) as usize;
    let mut raw = fw.allocate_pages(Placement::Anywhere, pages)?;
    let dst = &mut raw.as_mut_slice()[..size];
    let mut filled = 0;
    while filled < size {
        let n = fw.read_file(&mut file, &mut dst[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled != size {
        if let Err(e) = fw.free_pages(raw) {
            warn!("raw kernel buffer not released: {}", e);
        }
        return Err(BootError::ShortRead {
            expected: size,
            read: filled,
        });
    }
    Ok(shrink(raw, size))
}

/// Limit a page-granular region to the bytes actually read.
fn shrink(region: PhysRegion, len: usize) -> PhysRegion {
    let mapping = region.mapping();
    let base = region.base();
    let (ptr, _) = region.into_raw();
    match mapping {
        Mapping::Identity => unsafe { PhysRegion::identity(ptr, len) },
        Mapping::Shadowed => unsafe { PhysRegion::shadowed(base, ptr, len) },
    }
}

/// Copy every loadable segment to its link address and zero its tail.
///
/// The pages are pinned at the plan's base: the kernel is linked against
/// absolute addresses and firmware maps memory one-to-one at this stage.
pub fn materialize<F: Firmware>(
    fw: &mut F,
    plan: &LoadPlan,
    image: &KernelImage<'_>,
) -> Result<LoadedKernel> {
    info!(
        "layout: min=0x{:x} max=0x{:x} size={} pages={}",
        plan.lowest(),
        plan.highest(),
        plan.span(),
        plan.pages()
    );
    let entry = image.entry_point();
    if !plan.contains(entry) {
        return Err(BootError::EntryOutsideImage { entry });
    }

    let mut region = fw.allocate_pages(Placement::At(plan.base()), plan.pages())?;
    if region.base() != plan.base() {
        let granted = region.base();
        if let Err(e) = fw.free_pages(region) {
            warn!("misplaced kernel pages not released: {}", e);
        }
        return Err(BootError::PlacementMismatch {
            requested: plan.base(),
            granted,
        });
    }

    let bytes = image.bytes();
    for segment in image.loadable_segments() {
        if segment.memory_size == 0 {
            continue;
        }
        let dst = region
            .window_mut(segment.virtual_address, segment.memory_size)
            .ok_or(BootError::MalformedImage("segment falls outside the load plan"))?;
        let (data, bss) = dst.split_at_mut(segment.file_size as usize);
        let start = segment.offset as usize;
        data.copy_from_slice(&bytes[start..start + segment.file_size as usize]);
        bss.fill(0);
        debug!(
            "segment 0x{:x}: {} bytes copied, {} zeroed",
            segment.virtual_address,
            segment.file_size,
            bss.len()
        );
    }
    info!("segments copied; entry_va = 0x{:x}", entry);

    Ok(LoadedKernel {
        entry: KernelEntry::new(entry),
        plan: *plan,
        image: region,
    })
}
