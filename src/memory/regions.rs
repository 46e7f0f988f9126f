//! Guest RAM region bookkeeping.

use std::fmt;

use crate::error::{Error, Result};

/// A contiguous range of guest physical RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Guest physical start address
    pub start: u64,
    /// Size in bytes
    pub size: u64,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// First address past the region.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Check if `[addr, addr + len)` lies wholly within this region.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end(),
            None => false,
        }
    }
}

/// The narrow interface boot code uses to reserve guest RAM.
pub trait RegionTracker {
    /// Start of the largest free region, if any RAM is still free.
    fn largest_free_region_start(&self) -> Option<u64>;

    /// Reserve `size` bytes from the first free region large enough.
    fn allocate(&mut self, size: u64) -> Result<u64>;

    /// Record `[start, start + size)` as in use. The range must be free RAM.
    fn mark_allocated(&mut self, start: u64, size: u64) -> Result<()>;

    /// Every RAM region, allocated or free, sorted by start address.
    fn ram_regions(&self) -> Vec<MemoryRegion>;
}

/// One entry of the RAM table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamRegion {
    pub start: u64,
    pub size: u64,
    pub allocated: bool,
}

impl RamRegion {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Sorted, non-overlapping table of guest RAM.
///
/// Abutting regions with the same allocation state are merged. Regions with
/// different states stay separate even when contiguous.
#[derive(Debug, Clone, Default)]
pub struct GuestRamRegions {
    regions: Vec<RamRegion>,
}

impl GuestRamRegions {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a free RAM range to the table.
    pub fn add_ram(&mut self, start: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidRegion { start, size, reason: "zero size" });
        }
        let end = start.checked_add(size).ok_or(Error::InvalidRegion {
            start,
            size,
            reason: "wraps the address space",
        })?;
        if self.regions.iter().any(|r| start < r.end() && r.start < end) {
            return Err(Error::InvalidRegion { start, size, reason: "overlaps existing RAM" });
        }

        let index = self.regions.partition_point(|r| r.start < start);
        self.regions.insert(index, RamRegion { start, size, allocated: false });
        self.coalesce();
        Ok(())
    }

    /// The raw table, including allocation state.
    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }

    /// Total bytes of RAM still free.
    pub fn free_bytes(&self) -> u64 {
        self.regions.iter().filter(|r| !r.allocated).map(|r| r.size).sum()
    }

    fn split_at(&mut self, addr: u64) {
        if let Some(index) = self.regions.iter().position(|r| r.start < addr && addr < r.end()) {
            let region = self.regions[index];
            self.regions[index].size = addr - region.start;
            self.regions.insert(
                index + 1,
                RamRegion { start: addr, size: region.end() - addr, allocated: region.allocated },
            );
        }
    }

    fn coalesce(&mut self) {
        self.regions.dedup_by(|next, prev| {
            if prev.end() == next.start && prev.allocated == next.allocated {
                prev.size += next.size;
                true
            } else {
                false
            }
        });
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        for region in &self.regions {
            if region.end() <= cursor {
                continue;
            }
            if region.start > cursor {
                break;
            }
            cursor = region.end();
            if cursor >= end {
                break;
            }
        }
        cursor >= end
    }
}

impl RegionTracker for GuestRamRegions {
    fn largest_free_region_start(&self) -> Option<u64> {
        self.regions
            .iter()
            .filter(|r| !r.allocated)
            .fold(None::<&RamRegion>, |best, r| match best {
                Some(b) if b.size >= r.size => Some(b),
                _ => Some(r),
            })
            .map(|r| r.start)
    }

    fn allocate(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidRegion { start: 0, size, reason: "zero-sized allocation" });
        }
        let start = self
            .regions
            .iter()
            .find(|r| !r.allocated && r.size >= size)
            .map(|r| r.start)
            .ok_or_else(|| {
                Error::OutOfGuestMemory(format!("no free region of 0x{:x} bytes", size))
            })?;
        self.mark_allocated(start, size)?;
        Ok(start)
    }

    fn mark_allocated(&mut self, start: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = start.checked_add(size).ok_or(Error::InvalidRegion {
            start,
            size,
            reason: "wraps the address space",
        })?;
        if !self.covers(start, end) {
            return Err(Error::OutOfGuestMemory(format!(
                "0x{:x}..0x{:x} is not backed by guest RAM",
                start, end
            )));
        }
        if let Some(used) = self
            .regions
            .iter()
            .find(|r| r.allocated && r.start < end && start < r.end())
        {
            return Err(Error::OutOfGuestMemory(format!(
                "0x{:x}..0x{:x} overlaps memory in use at 0x{:x}..0x{:x}",
                start,
                end,
                used.start,
                used.end()
            )));
        }

        self.split_at(start);
        self.split_at(end);
        for region in self.regions.iter_mut() {
            if region.start >= start && region.end() <= end {
                region.allocated = true;
            }
        }
        self.coalesce();
        Ok(())
    }

    fn ram_regions(&self) -> Vec<MemoryRegion> {
        self.regions.iter().map(|r| MemoryRegion::new(r.start, r.size)).collect()
    }
}

impl fmt::Display for GuestRamRegions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for region in &self.regions {
            writeln!(
                f,
                "\t0x{:x} - 0x{:x} ({} KB) {}",
                region.start,
                region.end(),
                region.size / 1024,
                if region.allocated { "allocated" } else { "free" }
            )?;
        }
        Ok(())
    }
}
