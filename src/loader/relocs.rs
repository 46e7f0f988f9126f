//! Guest kernel relocation.
//!
//! The relocs file uses the Linux decompressor format:
//!
//! ```text
//!     0 - zero terminator for 64 bit relocations
//!     64 bit relocation repeated
//!     0 - zero terminator for 32 bit relocations
//!     32 bit relocation repeated
//!     <EOF>
//! ```
//!
//! Every entry is a 4-byte little-endian virtual address. The file is read
//! backwards from EOF and only the 32-bit class is applied; scanning stops
//! at its terminator, so 64-bit entries are never looked at.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::image::GuestImage;
use crate::memory::{GuestMemory, GuestVspace, RegionTracker};

/// Emit a progress line after this many relocations.
pub const PROGRESS_INTERVAL: usize = 50_000;

/// Bytes read from the file per backward step.
const READ_CHUNK: u64 = 4096;

/// Reads 4-byte little-endian words from the end of a file towards its
/// start.
struct ReverseWords<'a, F> {
    file: &'a mut F,
    /// File offset where `buf` starts
    pos: u64,
    buf: Vec<u8>,
    /// Words of `buf` not yet returned
    remaining: usize,
}

impl<'a, F: Read + Seek> ReverseWords<'a, F> {
    fn new(file: &'a mut F) -> Result<Self> {
        let len = file.seek(SeekFrom::End(0))?;
        if len % 4 != 0 {
            return Err(Error::InvalidRelocs(format!(
                "file size {} is not a multiple of 4",
                len
            )));
        }
        Ok(Self { file, pos: len, buf: Vec::new(), remaining: 0 })
    }

    fn is_empty(&self) -> bool {
        self.pos == 0 && self.remaining == 0
    }

    fn next_word(&mut self) -> Result<Option<u32>> {
        if self.remaining == 0 {
            if self.pos == 0 {
                return Ok(None);
            }
            let len = self.pos.min(READ_CHUNK);
            self.pos -= len;
            self.file.seek(SeekFrom::Start(self.pos))?;
            self.buf.resize(len as usize, 0);
            self.file.read_exact(&mut self.buf)?;
            self.remaining = self.buf.len() / 4;
        }
        self.remaining -= 1;
        let at = self.remaining * 4;
        let word = [self.buf[at], self.buf[at + 1], self.buf[at + 2], self.buf[at + 3]];
        Ok(Some(u32::from_le_bytes(word)))
    }
}

/// Apply the relocs file at `path` to the loaded kernel.
///
/// Does nothing, without opening the file, when the kernel was loaded at
/// its link address.
pub fn relocate_guest_elf<R, V>(
    mem: &mut GuestMemory<R, V>,
    image: &GuestImage,
    path: &Path,
) -> Result<usize>
where
    R: RegionTracker,
    V: GuestVspace,
{
    if !image.needs_relocation() {
        return Ok(0);
    }
    debug!("Opening relocs file {}", path.display());
    let mut file = File::open(path).map_err(|e| Error::open_failed(e, path, Error::RelocsNotFound))?;
    relocate_guest_elf_from(mem, image, &mut file)
}

/// Add the relocation offset to every 32-bit word named by the relocs
/// table.
///
/// Each entry `vaddr` maps to guest physical `vaddr - link_vaddr +
/// load_paddr` and must land inside a loaded segment. The word there is
/// adjusted modulo 2^32. Returns the number of relocations applied.
pub fn relocate_guest_elf_from<R, V, F>(
    mem: &mut GuestMemory<R, V>,
    image: &GuestImage,
    file: &mut F,
) -> Result<usize>
where
    R: RegionTracker,
    V: GuestVspace,
    F: Read + Seek,
{
    if !image.needs_relocation() {
        return Ok(0);
    }
    info!(
        "Relocating guest kernel from 0x{:x} --> 0x{:x}",
        image.link_paddr, image.load_paddr
    );

    // Two's complement truncation: adding this wraps exactly like adding
    // the signed offset modulo 2^32.
    let delta = image.relocation_offset as u32;

    let mut words = ReverseWords::new(file)?;
    if words.is_empty() {
        return Err(Error::RelocationUnsupported);
    }

    let mut count = 0usize;
    let mut last_vaddr = None;
    loop {
        let vaddr = match words.next_word()? {
            Some(0) => break,
            Some(vaddr) => vaddr,
            None => {
                return Err(Error::InvalidRelocs(
                    "no terminator before the 32-bit relocations".into(),
                ))
            }
        };

        let paddr = relocation_target(image, vaddr)?;
        trace!("reloc vaddr 0x{:x} guest_addr 0x{:x}", vaddr, paddr);

        let value = mem.read_u32(paddr)?;
        mem.write_u32(paddr, value.wrapping_add(delta))?;

        count += 1;
        last_vaddr = Some(vaddr);
        if count % PROGRESS_INTERVAL == 0 {
            debug!("{} relocs done", count);
        }
    }

    if count == 0 {
        return Err(Error::RelocationUnsupported);
    }
    if let Some(vaddr) = last_vaddr {
        debug!("Last relocated addr was 0x{:x}", vaddr);
    }
    info!("{} kernel relocations completed", count);
    Ok(count)
}

/// Guest physical address of the word a relocation entry names.
fn relocation_target(image: &GuestImage, vaddr: u32) -> Result<u64> {
    let offset = (vaddr as u64)
        .checked_sub(image.link_vaddr)
        .ok_or(Error::RelocationBelowLinkBase { vaddr, link_vaddr: image.link_vaddr })?;
    let paddr = offset
        .checked_add(image.load_paddr)
        .ok_or(Error::RelocationOutOfImage { vaddr, paddr: u64::MAX })?;
    if !image.segment_contains(paddr, 4) {
        return Err(Error::RelocationOutOfImage { vaddr, paddr });
    }
    Ok(paddr)
}
