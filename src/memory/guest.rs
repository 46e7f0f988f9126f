//! Host-backed guest RAM.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use super::layout::PAGE_SIZE;
use super::regions::MemoryRegion;
use super::vspace::GuestVspace;
use crate::error::{Error, Result};

/// A contiguous window of guest physical memory backed by anonymous host
/// memory.
///
/// The window starts at guest physical address `base`. Every guest page in
/// it is backed, so [`GuestVspace::map_page`] only fails outside the window.
pub struct GuestRam {
    /// Pointer to the allocated memory
    ptr: *mut u8,
    /// Guest-visible size in bytes (multiple of the guest page size)
    size: usize,
    /// Size of the host allocation in bytes
    alloc_size: usize,
    /// Guest physical address of the first byte
    base: u64,
    /// Page guards currently alive
    mapped: Cell<usize>,
}

// Safety: GuestRam owns its allocation and can be sent between threads
unsafe impl Send for GuestRam {}

impl GuestRam {
    /// Allocate `size` bytes of guest RAM starting at guest address `base`.
    ///
    /// The memory is zero-initialized and rounded up to whole pages.
    pub fn new(base: u64, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryAllocationFailed(
                "Size must be greater than 0".to_string(),
            ));
        }
        if base % PAGE_SIZE != 0 {
            return Err(Error::MemoryAllocationFailed(format!(
                "base 0x{:x} is not page aligned",
                base
            )));
        }

        let page = PAGE_SIZE as usize;
        let size = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or_else(|| Error::MemoryAllocationFailed("size overflows".to_string()))?;
        if base.checked_add(size as u64).is_none() {
            return Err(Error::MemoryAllocationFailed(
                "window wraps the guest address space".to_string(),
            ));
        }

        // Round the host allocation up to the host page size
        let host_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let alloc_size = (size + host_page - 1) & !(host_page - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                alloc_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            alloc_size,
            base,
            mapped: Cell::new(0),
        })
    }

    /// Guest physical address of the first byte.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the window in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The window as a RAM region.
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.size as u64)
    }

    /// Number of page guards currently alive.
    pub fn mapped_pages(&self) -> usize {
        self.mapped.get()
    }

    fn host_offset(&self, addr: u64, len: usize) -> Result<usize> {
        if !self.region().contains_range(addr, len as u64) {
            return Err(Error::UnbackedGuestPage(addr));
        }
        Ok((addr - self.base) as usize)
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.host_offset(addr, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Write bytes to a guest physical address.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let offset = self.host_offset(addr, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
        Ok(())
    }
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam")
            .field("base", &format_args!("0x{:x}", self.base))
            .field("size", &self.size)
            .field("mapped", &self.mapped.get())
            .finish()
    }
}

impl Drop for GuestRam {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.alloc_size);
            }
        }
    }
}

/// A mapped page of [`GuestRam`].
pub struct RamPage<'a> {
    data: &'a mut [u8],
    mapped: &'a Cell<usize>,
}

impl Deref for RamPage<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl DerefMut for RamPage<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

impl Drop for RamPage<'_> {
    fn drop(&mut self) {
        self.mapped.set(self.mapped.get() - 1);
    }
}

impl GuestVspace for GuestRam {
    type Page<'a> = RamPage<'a>;

    fn page_size(&self) -> u64 {
        PAGE_SIZE
    }

    fn map_page(&mut self, page_addr: u64) -> Result<RamPage<'_>> {
        if page_addr % PAGE_SIZE != 0 {
            return Err(Error::UnbackedGuestPage(page_addr));
        }
        let offset = self.host_offset(page_addr, PAGE_SIZE as usize)?;

        self.mapped.set(self.mapped.get() + 1);
        // Safety: offset..offset + PAGE_SIZE lies within the allocation, and
        // the returned guard borrows self mutably so no other view exists.
        let data = unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), PAGE_SIZE as usize) };
        Ok(RamPage { data, mapped: &self.mapped })
    }
}
