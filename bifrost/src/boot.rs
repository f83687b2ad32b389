//! Boot transition: load the kernel, take the memory map, leave boot
//! services, enter the kernel. Strictly in that order, and never backwards
//! once boot services are gone.

use core::fmt;

use log::{info, warn};
use uefi::Status;

use crate::config::MAX_EXIT_ATTEMPTS;
use crate::entry::KernelEntry;
use crate::error::{BootError, Result};
use crate::firmware::Firmware;
use crate::loader::{self, LoadedKernel};
use crate::memmap::{self, Harvest, MemoryMap};
use crate::region::PhysRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    Init,
    WatchdogDisabled,
    KernelLoaded,
    MemoryMapHarvested,
    BootServicesExited,
    KernelRunning,
    Halted,
}

impl BootStage {
    fn next(self) -> Option<Self> {
        use BootStage::*;
        match self {
            Init => Some(WatchdogDisabled),
            WatchdogDisabled => Some(KernelLoaded),
            KernelLoaded => Some(MemoryMapHarvested),
            MemoryMapHarvested => Some(BootServicesExited),
            BootServicesExited => Some(KernelRunning),
            KernelRunning => Some(Halted),
            Halted => None,
        }
    }

    /// Move one step forward. Anything else is a sequencing bug.
    fn advance(&mut self, to: BootStage) {
        assert_eq!(self.next(), Some(to), "boot stage {} cannot move to {}", self, to);
        *self = to;
        info!("[step] {}", to);
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStage::Init => "init",
            BootStage::WatchdogDisabled => "watchdog disabled",
            BootStage::KernelLoaded => "kernel loaded",
            BootStage::MemoryMapHarvested => "memory map harvested",
            BootStage::BootServicesExited => "boot services exited",
            BootStage::KernelRunning => "kernel running",
            BootStage::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// The pre-transition half of the boot, holding the firmware session.
pub struct Bootstrap<F: Firmware> {
    fw: F,
    stage: BootStage,
}

impl<F: Firmware> Bootstrap<F> {
    pub fn new(fw: F) -> Self {
        Self {
            fw,
            stage: BootStage::Init,
        }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    pub fn firmware(&self) -> &F {
        &self.fw
    }

    pub fn disable_watchdog(&mut self) -> Result<()> {
        self.fw.disable_watchdog()?;
        self.stage.advance(BootStage::WatchdogDisabled);
        Ok(())
    }

    pub fn load_kernel(&mut self, path: &'static str) -> Result<LoadedKernel> {
        let loaded = loader::load_kernel(&mut self.fw, path)?;
        self.stage.advance(BootStage::KernelLoaded);
        Ok(loaded)
    }

    /// Must be the last thing that touches firmware memory before
    /// [`Bootstrap::exit_boot_services`].
    pub fn harvest(&mut self) -> Result<Harvest> {
        let harvest = memmap::harvest(&mut self.fw)?;
        self.stage.advance(BootStage::MemoryMapHarvested);
        Ok(harvest)
    }

    /// Present the map key and leave boot services.
    ///
    /// A rejected key means the map changed after it was taken; the map is
    /// re-queried into the same buffer and the exit retried, at most
    /// `MAX_EXIT_ATTEMPTS` times in total.
    pub fn exit_boot_services(
        self,
        kernel: LoadedKernel,
        mut harvest: Harvest,
    ) -> Result<Handoff<F::Exited>> {
        let Bootstrap { mut fw, mut stage } = self;
        for attempt in 1..=MAX_EXIT_ATTEMPTS {
            match fw.exit_boot_services(harvest.map_key()) {
                Ok(exited) => {
                    stage.advance(BootStage::BootServicesExited);
                    return Ok(Handoff {
                        entry: kernel.entry,
                        memory_map: harvest.into_map(),
                        kernel: kernel.image,
                        exited,
                        stage,
                    });
                }
                Err((back, status)) if status == Status::INVALID_PARAMETER => {
                    warn!("ExitBootServices rejected map key (attempt {attempt})");
                    if attempt == MAX_EXIT_ATTEMPTS {
                        break;
                    }
                    fw = back;
                    harvest.refresh(&mut fw)?;
                }
                Err((_, status)) => return Err(BootError::firmware("ExitBootServices", status)),
            }
        }
        Err(BootError::MapTokenStale {
            attempts: MAX_EXIT_ATTEMPTS,
        })
    }
}

/// Everything the kernel needs, with boot services already gone.
pub struct Handoff<X> {
    pub entry: KernelEntry,
    pub memory_map: MemoryMap,
    /// Pages holding the kernel image. Never freed by the loader.
    pub kernel: PhysRegion,
    pub exited: X,
    stage: BootStage,
}

impl<X> Handoff<X> {
    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// Call the kernel. Returns `Ok` only if the kernel does, which is always
    /// a failure; the caller must halt either way. A kernel region that is
    /// not identity-mapped is never entered.
    ///
    /// # Safety
    /// Must run on the firmware's identity mapping with the kernel image
    /// placed by this loader.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn enter(self) -> Result<u64> {
        let Handoff {
            entry,
            memory_map,
            kernel,
            mut stage,
            ..
        } = self;
        if !kernel.is_identity_mapped() {
            return Err(BootError::KernelNotIdentityMapped {
                base: kernel.base(),
            });
        }
        stage.advance(BootStage::KernelRunning);
        let status = unsafe { entry.call(memory_map) };
        stage.advance(BootStage::Halted);
        Ok(status)
    }
}

/// Run the whole pre-kernel sequence.
pub fn boot<F: Firmware>(fw: F, path: &'static str) -> Result<Handoff<F::Exited>> {
    let mut boot = Bootstrap::new(fw);
    boot.disable_watchdog()?;
    let kernel = boot.load_kernel(path)?;
    let harvest = boot.harvest()?;
    boot.exit_boot_services(kernel, harvest)
}
