use crate::config::PAGE_SIZE;
use crate::elf::Segment;
use crate::error::{BootError, Result};

/// Address range the loadable segments occupy once placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    lowest: u64,
    highest: u64,
}

impl LoadPlan {
    /// Span all loadable segments. Segments with no memory footprint are
    /// ignored.
    pub fn plan<I>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = Segment>,
    {
        let mut lowest = u64::MAX;
        let mut highest = 0;
        for segment in segments {
            if !segment.is_loadable() || segment.memory_size == 0 {
                continue;
            }
            lowest = lowest.min(segment.virtual_address);
            highest = highest.max(segment.memory_end());
        }
        if lowest == u64::MAX {
            return Err(BootError::EmptyImage);
        }
        Ok(Self { lowest, highest })
    }

    pub fn lowest(&self) -> u64 {
        self.lowest
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    pub fn span(&self) -> u64 {
        self.highest - self.lowest
    }

    /// Page-aligned start of the pinned allocation.
    pub fn base(&self) -> u64 {
        align_down(self.lowest, PAGE_SIZE)
    }

    /// Pages needed to back `[base, highest)`.
    pub fn pages(&self) -> usize {
        (self.highest - self.base()).div_ceil(PAGE_SIZE) as usize
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.lowest..self.highest).contains(&addr)
    }
}

#[inline]
fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}
