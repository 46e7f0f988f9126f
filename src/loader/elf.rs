//! ELF segment loader.
//!
//! Copies every `PT_LOAD` segment of a guest kernel into guest RAM. The
//! kernel is placed at the start of the largest free RAM region rather than
//! at its link address; the difference is recorded as the relocation offset
//! for [`crate::loader::relocs`] to apply.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use goblin::container::{Container, Ctx};
use goblin::elf::program_header::{ProgramHeader, PT_LOAD};
use goblin::elf::Elf;
use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::image::{offset_addr, GuestImage, LoadedSegment};
use crate::memory::{align_up, GuestMemory, GuestVspace, RegionTracker};

/// Largest ELF file header (ELF64).
const ELF_HEADER_MAX: usize = 64;

/// A loadable program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSegment {
    /// Offset of the segment's bytes in the file
    pub file_offset: u64,
    /// Virtual address the segment was linked at
    pub mem_vaddr: u64,
    /// Physical address the segment was linked at
    pub mem_paddr: u64,
    /// Bytes present in the file
    pub file_size: u64,
    /// Bytes occupied in memory; the tail past `file_size` is zeroed
    pub mem_size: u64,
}

impl ProgramSegment {
    fn from_header(ph: &ProgramHeader) -> Result<Self> {
        if ph.p_filesz > ph.p_memsz {
            return Err(Error::InvalidKernel(format!(
                "segment at 0x{:x} has file size 0x{:x} larger than memory size 0x{:x}",
                ph.p_paddr, ph.p_filesz, ph.p_memsz
            )));
        }
        Ok(Self {
            file_offset: ph.p_offset,
            mem_vaddr: ph.p_vaddr,
            mem_paddr: ph.p_paddr,
            file_size: ph.p_filesz,
            mem_size: ph.p_memsz,
        })
    }
}

/// Parsed ELF layout: entry point and loadable segments.
#[derive(Debug, Clone)]
pub struct ElfLayout {
    pub entry: u64,
    pub segments: Vec<ProgramSegment>,
}

impl ElfLayout {
    /// Read the ELF header and program header table.
    ///
    /// Only `PT_LOAD` headers are kept.
    pub fn read<F: Read + Seek>(file: &mut F) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut ident = Vec::with_capacity(ELF_HEADER_MAX);
        file.by_ref().take(ELF_HEADER_MAX as u64).read_to_end(&mut ident)?;

        let header = Elf::parse_header(&ident)
            .map_err(|e| Error::InvalidKernel(format!("bad ELF header: {}", e)))?;
        let container = header
            .container()
            .map_err(|e| Error::InvalidKernel(e.to_string()))?;
        let endianness = header
            .endianness()
            .map_err(|e| Error::InvalidKernel(e.to_string()))?;
        let ctx = Ctx::new(container, endianness);

        let entsize = match container {
            Container::Big => 56,
            Container::Little => 32,
        };
        if header.e_phnum == 0 {
            return Err(Error::InvalidKernel("no program headers".into()));
        }
        if header.e_phentsize as usize != entsize {
            return Err(Error::InvalidKernel(format!(
                "program header size {} (expected {})",
                header.e_phentsize, entsize
            )));
        }

        let mut table = vec![0u8; header.e_phnum as usize * entsize];
        file.seek(SeekFrom::Start(header.e_phoff))?;
        file.read_exact(&mut table).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::InvalidKernel("truncated program header table".into())
            }
            _ => Error::Io(e),
        })?;

        let headers = ProgramHeader::parse(&table, 0, header.e_phnum as usize, ctx)
            .map_err(|e| Error::InvalidKernel(format!("bad program headers: {}", e)))?;
        let segments = headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(ProgramSegment::from_header)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { entry: header.e_entry, segments })
    }

    /// Lowest linked physical and virtual addresses across all segments.
    pub fn link_base(&self) -> Option<(u64, u64)> {
        let paddr = self.segments.iter().map(|s| s.mem_paddr).min()?;
        let vaddr = self.segments.iter().map(|s| s.mem_vaddr).min()?;
        Some((paddr, vaddr))
    }
}

/// Load the guest kernel at `path`.
///
/// See [`load_guest_elf_from`].
pub fn load_guest_elf<R, V>(
    mem: &mut GuestMemory<R, V>,
    path: &Path,
    alignment: u64,
) -> Result<GuestImage>
where
    R: RegionTracker,
    V: GuestVspace,
{
    debug!("Loading guest elf {}", path.display());
    let mut file = File::open(path).map_err(|e| Error::open_failed(e, path, Error::KernelNotFound))?;
    load_guest_elf_from(mem, &mut file, alignment)
}

/// Load a guest kernel ELF into the largest free RAM region, aligned up to
/// `alignment`.
///
/// Each segment is copied to its linked physical address plus the
/// relocation offset and then marked allocated. Returns the image layout
/// with everything but the boot structure fields filled in.
pub fn load_guest_elf_from<R, V, F>(
    mem: &mut GuestMemory<R, V>,
    file: &mut F,
    alignment: u64,
) -> Result<GuestImage>
where
    R: RegionTracker,
    V: GuestVspace,
    F: Read + Seek,
{
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "load alignment 0x{:x} is not a power of two",
            alignment
        )));
    }

    let layout = ElfLayout::read(file)?;
    let (link_paddr, link_vaddr) = layout
        .link_base()
        .ok_or_else(|| Error::InvalidKernel("no PT_LOAD segments".into()))?;

    let free_start = mem
        .ram
        .largest_free_region_start()
        .ok_or_else(|| Error::OutOfGuestMemory("no free region for the kernel".into()))?;
    // The aligned address may fall outside the region; the page copy
    // fails in that case.
    let load_paddr = align_up(free_start, alignment)
        .ok_or_else(|| Error::OutOfGuestMemory("aligned load address overflows".into()))?;

    let relocation_offset = i64::try_from(load_paddr as i128 - link_paddr as i128)
        .map_err(|_| Error::InvalidKernel("relocation offset out of range".into()))?;

    info!(
        "Guest kernel is compiled to be located at paddr 0x{:x} vaddr 0x{:x}",
        link_paddr, link_vaddr
    );
    info!("Guest kernel allocated 1:1 start is at paddr = 0x{:x}", load_paddr);
    info!(
        "Therefore relocation offset is {} ({}0x{:x})",
        relocation_offset,
        if relocation_offset < 0 { "-" } else { "" },
        relocation_offset.unsigned_abs()
    );

    let mut segments = Vec::with_capacity(layout.segments.len());
    for segment in layout.segments.iter().filter(|s| s.mem_size != 0) {
        let dest = offset_addr(segment.mem_paddr, relocation_offset).ok_or_else(|| {
            Error::InvalidKernel(format!("segment at 0x{:x} relocates out of range", segment.mem_paddr))
        })?;

        mem.ram.mark_allocated(dest, segment.mem_size)?;
        load_segment(mem, file, segment, dest)?;
        segments.push(LoadedSegment { paddr: dest, size: segment.mem_size });
    }

    let entry = offset_addr(layout.entry, relocation_offset)
        .ok_or_else(|| Error::InvalidKernel("entry point relocates out of range".into()))?;

    Ok(GuestImage {
        load_paddr,
        link_paddr,
        link_vaddr,
        relocation_offset,
        alignment,
        entry,
        segments,
        ..Default::default()
    })
}

/// Copy one segment to `dest`, page by page, zero-filling past the file
/// bytes.
fn load_segment<R, V, F>(
    mem: &mut GuestMemory<R, V>,
    file: &mut F,
    segment: &ProgramSegment,
    dest: u64,
) -> Result<()>
where
    R: RegionTracker,
    V: GuestVspace,
    F: Read + Seek,
{
    debug!(
        "Loading segment file offset 0x{:x} to 0x{:x} (file 0x{:x} mem 0x{:x})",
        segment.file_offset, dest, segment.file_size, segment.mem_size
    );

    file.seek(SeekFrom::Start(segment.file_offset))?;
    let file_size = segment.file_size as usize;

    mem.touch(dest, segment.mem_size, |chunk| {
        let from_file = file_size.saturating_sub(chunk.offset).min(chunk.data.len());
        trace!(
            "load page dest 0x{:x} offset 0x{:x} len 0x{:x} from file 0x{:x}",
            chunk.paddr,
            chunk.offset,
            chunk.data.len(),
            from_file
        );

        let (copied, zeroed) = chunk.data.split_at_mut(from_file);
        file.read_exact(copied).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::InvalidKernel(format!(
                "segment at file offset 0x{:x} extends past end of file",
                segment.file_offset
            )),
            _ => Error::Io(e),
        })?;
        zeroed.fill(0);
        Ok(())
    })
    .map_err(|e| match e {
        Error::UnbackedGuestPage(addr) => Error::OutOfGuestMemory(format!(
            "no guest frame at 0x{:x} while loading elf segment at 0x{:x}",
            addr, dest
        )),
        other => other,
    })
}

/// One program header of a test ELF image.
#[cfg(test)]
pub(crate) struct TestSegment {
    pub p_type: u32,
    pub vaddr: u64,
    pub paddr: u64,
    pub bytes: Vec<u8>,
    pub mem_size: u64,
}

#[cfg(test)]
pub(crate) fn test_segment(p_type: u32, vaddr: u64, paddr: u64, bytes: &[u8], mem_size: u64) -> TestSegment {
    TestSegment { p_type, vaddr, paddr, bytes: bytes.to_vec(), mem_size }
}

/// Build a little-endian ELF64 image. Segment bytes follow the program
/// header table.
#[cfg(test)]
pub(crate) fn build_test_elf(entry: u64, segments: &[TestSegment]) -> Vec<u8> {
    let phoff = 64usize;
    let mut data_offset = phoff + segments.len() * 56;

    let mut elf = vec![0u8; data_offset];
    elf[0..4].copy_from_slice(b"\x7fELF");
    elf[4] = 2; // ELFCLASS64
    elf[5] = 1; // ELFDATA2LSB
    elf[6] = 1; // EV_CURRENT
    elf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
    elf[20..24].copy_from_slice(&1u32.to_le_bytes());
    elf[24..32].copy_from_slice(&entry.to_le_bytes());
    elf[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
    elf[52..54].copy_from_slice(&64u16.to_le_bytes());
    elf[54..56].copy_from_slice(&56u16.to_le_bytes());
    elf[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

    for (i, seg) in segments.iter().enumerate() {
        let ph = phoff + i * 56;
        elf[ph..ph + 4].copy_from_slice(&seg.p_type.to_le_bytes());
        elf[ph + 4..ph + 8].copy_from_slice(&7u32.to_le_bytes());
        elf[ph + 8..ph + 16].copy_from_slice(&(data_offset as u64).to_le_bytes());
        elf[ph + 16..ph + 24].copy_from_slice(&seg.vaddr.to_le_bytes());
        elf[ph + 24..ph + 32].copy_from_slice(&seg.paddr.to_le_bytes());
        elf[ph + 32..ph + 40].copy_from_slice(&(seg.bytes.len() as u64).to_le_bytes());
        elf[ph + 40..ph + 48].copy_from_slice(&seg.mem_size.to_le_bytes());
        elf[ph + 48..ph + 56].copy_from_slice(&0x1000u64.to_le_bytes());
        elf.extend_from_slice(&seg.bytes);
        data_offset += seg.bytes.len();
    }
    elf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GuestRam, GuestRamRegions};
    use std::io::Cursor;

    const PT_NOTE: u32 = 4;

    fn guest_memory(ram_start: u64, ram_size: u64) -> GuestMemory<GuestRamRegions, GuestRam> {
        let ram = GuestRam::new(0, (ram_start + ram_size) as usize).unwrap();
        let mut regions = GuestRamRegions::new();
        regions.add_ram(ram_start, ram_size).unwrap();
        GuestMemory::new(regions, ram)
    }

    #[test]
    fn test_load_relocates_segments() {
        let text: Vec<u8> = (0..0x1800u32).map(|i| i as u8).collect();
        let data = vec![0x5a; 0x10];
        let elf = build_test_elf(
            0x100100,
            &[
                test_segment(PT_LOAD, 0xc0100000, 0x100000, &text, 0x1800),
                test_segment(PT_NOTE, 0x1000, 0x1000, &[1, 2, 3, 4], 4),
                test_segment(PT_LOAD, 0xc0102000, 0x102000, &data, 0x2000),
            ],
        );
        let mut mem = guest_memory(0x200000, 0x400000);
        // Leave garbage where the BSS will land
        mem.vspace.write(0x202010, &[0xff; 0x100]).unwrap();

        let image = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x100000).unwrap();

        assert_eq!(image.link_paddr, 0x100000);
        assert_eq!(image.link_vaddr, 0xc0100000);
        assert_eq!(image.load_paddr, 0x200000);
        assert_eq!(image.relocation_offset, 0x100000);
        assert_eq!(image.entry, 0x200100);
        assert_eq!(
            image.segments,
            vec![
                LoadedSegment { paddr: 0x200000, size: 0x1800 },
                LoadedSegment { paddr: 0x202000, size: 0x2000 },
            ]
        );

        let mut back = vec![0u8; 0x1800];
        mem.vspace.read(0x200000, &mut back).unwrap();
        assert_eq!(back, text);

        let mut bss = vec![0xeeu8; 0x2000];
        mem.vspace.read(0x202000, &mut bss).unwrap();
        assert_eq!(&bss[..0x10], &data[..]);
        assert!(bss[0x10..].iter().all(|&b| b == 0));

        // Both destinations are now reserved
        assert_eq!(mem.ram.largest_free_region_start(), Some(0x204000));
        assert_eq!(mem.vspace.mapped_pages(), 0);
    }

    #[test]
    fn test_load_at_link_address() {
        let elf = build_test_elf(0x200000, &[test_segment(PT_LOAD, 0x200000, 0x200000, &[0x90; 16], 16)]);
        let mut mem = guest_memory(0x200000, 0x100000);
        let image = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x1000).unwrap();
        assert_eq!(image.relocation_offset, 0);
        assert!(!image.needs_relocation());
        assert_eq!(image.entry, 0x200000);
    }

    #[test]
    fn test_load_downward_offset() {
        let elf = build_test_elf(0x1000010, &[test_segment(PT_LOAD, 0x1000000, 0x1000000, &[1; 8], 8)]);
        let mut mem = guest_memory(0x400000, 0x100000);
        let image = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x1000).unwrap();
        assert_eq!(image.relocation_offset, -0xc00000);
        assert_eq!(image.entry, 0x400010);
    }

    #[test]
    fn test_zero_sized_segment_skipped() {
        let elf = build_test_elf(
            0x100000,
            &[test_segment(PT_LOAD, 0x100000, 0x100000, &[1; 4], 4), test_segment(PT_LOAD, 0x0f0000, 0x0f0000, &[], 0)],
        );
        let mut mem = guest_memory(0x100000, 0x100000);
        let image = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x1000).unwrap();
        // The empty segment still lowers the link base
        assert_eq!(image.link_paddr, 0x0f0000);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].paddr, 0x110000);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut elf = build_test_elf(0, &[test_segment(PT_LOAD, 0, 0, &[0; 4], 4)]);
        elf[0] = 0;
        let mut mem = guest_memory(0x100000, 0x100000);
        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x1000).unwrap_err();
        assert!(matches!(err, Error::InvalidKernel(_)));
    }

    #[test]
    fn test_rejects_truncated_headers() {
        let elf = build_test_elf(0, &[test_segment(PT_LOAD, 0, 0, &[0; 4], 4)]);
        let mut mem = guest_memory(0x100000, 0x100000);

        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf[..40].to_vec()), 0x1000)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKernel(_)));

        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf[..100].to_vec()), 0x1000)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKernel(_)));
    }

    #[test]
    fn test_rejects_truncated_segment_data() {
        let mut elf = build_test_elf(0x100000, &[test_segment(PT_LOAD, 0x100000, 0x100000, &[7; 64], 64)]);
        elf.truncate(elf.len() - 32);
        let mut mem = guest_memory(0x100000, 0x100000);
        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x1000).unwrap_err();
        assert!(matches!(err, Error::InvalidKernel(_)));
        assert_eq!(mem.vspace.mapped_pages(), 0);
    }

    #[test]
    fn test_rejects_file_size_above_mem_size() {
        let elf = build_test_elf(0x100000, &[test_segment(PT_LOAD, 0x100000, 0x100000, &[7; 64], 32)]);
        let mut mem = guest_memory(0x100000, 0x100000);
        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x1000).unwrap_err();
        assert!(matches!(err, Error::InvalidKernel(_)));
    }

    #[test]
    fn test_aligned_load_past_ram() {
        let elf = build_test_elf(0x100000, &[test_segment(PT_LOAD, 0x100000, 0x100000, &[7; 64], 64)]);
        // RAM ends at 0x180000 but the 1MB alignment pushes the load to 0x200000
        let mut mem = guest_memory(0x101000, 0x7f000);
        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x100000).unwrap_err();
        assert!(matches!(err, Error::OutOfGuestMemory(_)));
    }

    #[test]
    fn test_rejects_overlapping_segments() {
        let elf = build_test_elf(
            0x100000,
            &[
                test_segment(PT_LOAD, 0x100000, 0x100000, &[0x11; 0x100], 0x2000),
                test_segment(PT_LOAD, 0x101000, 0x101000, &[0x22; 0x100], 0x1000),
            ],
        );
        let mut mem = guest_memory(0x100000, 0x100000);
        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x100000).unwrap_err();
        assert!(matches!(err, Error::OutOfGuestMemory(_)));

        // The second segment was refused before anything was copied over the first
        let mut back = [0u8; 4];
        mem.read(0x101000, &mut back).unwrap();
        assert_eq!(back, [0; 4]);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let elf = build_test_elf(0x100000, &[test_segment(PT_LOAD, 0x100000, 0x100000, &[7; 4], 4)]);
        let mut mem = guest_memory(0x100000, 0x100000);
        let err = load_guest_elf_from(&mut mem, &mut Cursor::new(elf), 0x3000).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_file() {
        let mut mem = guest_memory(0x100000, 0x100000);
        let err = load_guest_elf(&mut mem, Path::new("/nonexistent/vmlinux"), 0x1000).unwrap_err();
        assert!(matches!(err, Error::KernelNotFound(_)));
    }
}
