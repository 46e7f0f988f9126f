//! Per-VM guest kernel image record.

/// A loaded segment's guest physical destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedSegment {
    /// Guest physical address the segment was copied to
    pub paddr: u64,
    /// Size in memory, including the zero-filled tail
    pub size: u64,
}

impl LoadedSegment {
    /// Check if `[addr, addr + len)` lies wholly within this segment.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.paddr && end <= self.paddr + self.size,
            None => false,
        }
    }
}

/// Where the guest kernel and its boot structures live.
///
/// Filled in stage by stage: the ELF loader sets the layout fields, the
/// boot module loader sets the module fields, and the boot structure
/// builder sets the command line and boot info pointers. The vCPU
/// initializer reads `entry` and `boot_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestImage {
    /// Guest physical address the kernel was actually loaded at
    pub load_paddr: u64,
    /// Lowest physical address the kernel was linked for
    pub link_paddr: u64,
    /// Lowest virtual address the kernel was linked for
    pub link_vaddr: u64,
    /// `load_paddr - link_paddr`
    pub relocation_offset: i64,
    /// Load alignment requested by the caller
    pub alignment: u64,
    /// Entry point after relocation
    pub entry: u64,
    /// Destination of every loaded segment
    pub segments: Vec<LoadedSegment>,
    /// Guest physical address of the command line string
    pub cmd_line: u64,
    /// Command line length, excluding the terminator
    pub cmd_line_len: u32,
    /// Guest physical address of the boot parameter block
    pub boot_info: u64,
    /// Guest physical address of the boot module, 0 if none
    pub boot_module_paddr: u64,
    /// Boot module size in bytes
    pub boot_module_size: u64,
}

impl GuestImage {
    /// Whether the kernel was loaded somewhere other than its link address.
    pub fn needs_relocation(&self) -> bool {
        self.relocation_offset != 0
    }

    /// Whether a boot module has been loaded.
    pub fn has_boot_module(&self) -> bool {
        self.boot_module_paddr != 0
    }

    /// Check if `[addr, addr + len)` lies inside one loaded segment.
    pub fn segment_contains(&self, addr: u64, len: u64) -> bool {
        self.segments.iter().any(|s| s.contains_range(addr, len))
    }
}

/// Apply a signed offset to an address, failing on wraparound.
pub(crate) fn offset_addr(addr: u64, offset: i64) -> Option<u64> {
    addr.checked_add_signed(offset)
}
