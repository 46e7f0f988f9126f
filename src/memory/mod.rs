//! Guest physical memory.
//!
//! Boot code never touches guest RAM directly. It reserves ranges through a
//! [`RegionTracker`] and copies bytes page by page through a [`GuestVspace`],
//! both bundled per VM in a [`GuestMemory`].

mod guest;
mod regions;
mod vspace;

pub use guest::{GuestRam, RamPage};
pub use regions::{GuestRamRegions, MemoryRegion, RamRegion, RegionTracker};
pub use vspace::{touch, GuestVspace, PageChunk};

use crate::error::Result;

/// Guest physical layout constants shared by the boot stages.
pub mod layout {
    /// Guest page size used for copies and device mappings.
    pub const PAGE_SIZE: u64 = 0x1000;

    /// End of the 32-bit physical address space described by the e820 map.
    pub const FOUR_GIB: u64 = 0x1_0000_0000;

    /// VBE protected-mode interfaces below this address need no extra mapping.
    pub const VBE_PM_LOW_LIMIT: u64 = 0xc000;

    /// Linear framebuffers are mapped in 64KB units.
    pub const FRAMEBUFFER_ALIGN: u64 = 0x10000;
}

/// Per-VM guest memory: the RAM region table and the address space that
/// backs it.
#[derive(Debug)]
pub struct GuestMemory<R, V> {
    /// Allocated/free RAM bookkeeping.
    pub ram: R,
    /// Page-granular access to guest physical memory.
    pub vspace: V,
}

impl<R: RegionTracker, V: GuestVspace> GuestMemory<R, V> {
    /// Bundle a region tracker with the address space it describes.
    pub fn new(ram: R, vspace: V) -> Self {
        Self { ram, vspace }
    }

    /// Run `f` once per page spanned by `[addr, addr + len)`.
    pub fn touch<F>(&mut self, addr: u64, len: u64, f: F) -> Result<()>
    where
        F: FnMut(PageChunk<'_>) -> Result<()>,
    {
        vspace::touch(&mut self.vspace, addr, len, f)
    }

    /// Copy guest bytes at `addr` into `buf`.
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.touch(addr, buf.len() as u64, |chunk| {
            buf[chunk.offset..chunk.offset + chunk.data.len()].copy_from_slice(chunk.data);
            Ok(())
        })
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.touch(addr, data.len() as u64, |chunk| {
            let len = chunk.data.len();
            chunk.data.copy_from_slice(&data[chunk.offset..chunk.offset + len]);
            Ok(())
        })
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self, addr: u64) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// Align value up to the given power-of-two alignment.
///
/// Returns `None` on overflow.
pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

/// Align value down to the given power-of-two alignment.
pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}
