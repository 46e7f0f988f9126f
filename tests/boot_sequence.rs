//! End-to-end boot of a relocated 32-bit kernel with an initrd.

use std::path::PathBuf;

use guestboot::loader::x86_64::{BootParams, E820Entry, E820Type, BOOT_PARAMS_SIZE};
use guestboot::{
    BootStage, Error, ErrorKind, GuestBoot, GuestMemory, GuestRam, GuestRamRegions, NoPlatform,
    UserContext,
};

const RAM_SIZE: u64 = 16 << 20;
const LINK_PADDR: u64 = 0x100000;
const LINK_VADDR: u32 = 0xc010_0000;
const TEXT_SIZE: usize = 0x3000;
const BSS_SIZE: u32 = 0x1000;

/// Little-endian ELF32 for i386 with a single PT_LOAD segment.
fn build_elf32(entry: u32, vaddr: u32, paddr: u32, text: &[u8], mem_size: u32) -> Vec<u8> {
    let mut elf = vec![0u8; 52 + 32];
    elf[0..4].copy_from_slice(b"\x7fELF");
    elf[4] = 1; // ELFCLASS32
    elf[5] = 1; // ELFDATA2LSB
    elf[6] = 1;
    elf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
    elf[20..24].copy_from_slice(&1u32.to_le_bytes());
    elf[24..28].copy_from_slice(&entry.to_le_bytes());
    elf[28..32].copy_from_slice(&52u32.to_le_bytes());
    elf[40..42].copy_from_slice(&52u16.to_le_bytes());
    elf[42..44].copy_from_slice(&32u16.to_le_bytes());
    elf[44..46].copy_from_slice(&1u16.to_le_bytes());

    let ph = &mut elf[52..84];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&84u32.to_le_bytes());
    ph[8..12].copy_from_slice(&vaddr.to_le_bytes());
    ph[12..16].copy_from_slice(&paddr.to_le_bytes());
    ph[16..20].copy_from_slice(&(text.len() as u32).to_le_bytes());
    ph[20..24].copy_from_slice(&mem_size.to_le_bytes());
    ph[24..28].copy_from_slice(&7u32.to_le_bytes());
    ph[28..32].copy_from_slice(&0x1000u32.to_le_bytes());

    elf.extend_from_slice(text);
    elf
}

/// Relocs file with the given 32-bit entries and no 64-bit entries.
fn build_relocs(entries: &[u32]) -> Vec<u8> {
    let mut words = vec![0u32, 0u32];
    words.extend_from_slice(entries);
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

struct TempFiles(Vec<PathBuf>);

impl TempFiles {
    fn write(&mut self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("guestboot-it-{}-{}", std::process::id(), name));
        std::fs::write(&path, bytes).unwrap();
        self.0.push(path.clone());
        path
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn guest_memory() -> GuestMemory<GuestRamRegions, GuestRam> {
    let ram = GuestRam::new(0, RAM_SIZE as usize).unwrap();
    let mut regions = GuestRamRegions::new();
    regions.add_ram(LINK_PADDR, RAM_SIZE - LINK_PADDR).unwrap();
    GuestMemory::new(regions, ram)
}

/// Kernel text holding two absolute pointers at offsets 0x10 and 0x2ffc.
fn kernel_text() -> Vec<u8> {
    let mut text: Vec<u8> = (0..TEXT_SIZE).map(|i| (i % 251) as u8).collect();
    text[0x10..0x14].copy_from_slice(&(LINK_VADDR + 0x400).to_le_bytes());
    text[0x2ffc..0x3000].copy_from_slice(&(LINK_VADDR + 0x2000).to_le_bytes());
    text
}

#[test]
fn test_relocated_boot_with_initrd() {
    let mut files = TempFiles(Vec::new());
    let text = kernel_text();
    let kernel = files.write(
        "vmlinux",
        &build_elf32(LINK_PADDR as u32, LINK_VADDR, LINK_PADDR as u32, &text, TEXT_SIZE as u32 + BSS_SIZE),
    );
    let relocs = files.write("vmlinux.relocs", &build_relocs(&[LINK_VADDR + 0x2ffc, LINK_VADDR + 0x10]));
    let initrd_bytes: Vec<u8> = (0..0x1800u32).map(|i| (i >> 3) as u8).collect();
    let initrd = files.write("initrd.img", &initrd_bytes);

    let mut mem = guest_memory();
    let mut boot = GuestBoot::builder()
        .kernel(&kernel)
        .relocs(&relocs)
        .initrd(&initrd)
        .cmdline("console=ttyS0 root=/dev/ram0")
        .build()
        .unwrap();
    let image = boot.run(&mut mem, &mut NoPlatform).unwrap().clone();
    assert_eq!(boot.stage(), BootStage::Configured);

    // Loaded at the first 4MB boundary of free RAM
    let load = 0x400000;
    let offset = load - LINK_PADDR;
    assert_eq!(image.load_paddr, load);
    assert_eq!(image.relocation_offset, offset as i64);
    assert_eq!(image.entry, load);

    // Both pointers moved by the offset, everything else untouched
    let mut loaded = vec![0u8; TEXT_SIZE + BSS_SIZE as usize];
    mem.read(load, &mut loaded).unwrap();
    assert_eq!(mem.read_u32(load + 0x10).unwrap(), LINK_VADDR + 0x400 + offset as u32);
    assert_eq!(mem.read_u32(load + 0x2ffc).unwrap(), LINK_VADDR + 0x2000 + offset as u32);
    assert_eq!(&loaded[0x14..0x2ffc], &text[0x14..0x2ffc]);
    assert!(loaded[TEXT_SIZE..].iter().all(|&b| b == 0));

    // Initrd lands at the start of the largest free region, after the kernel
    assert_eq!(image.boot_module_paddr, load + TEXT_SIZE as u64 + BSS_SIZE as u64);
    let mut back = vec![0u8; initrd_bytes.len()];
    mem.read(image.boot_module_paddr, &mut back).unwrap();
    assert_eq!(back, initrd_bytes);

    // Command line first-fit at the bottom of RAM, boot info right after
    assert_eq!(image.cmd_line, LINK_PADDR);
    let mut cmdline = vec![0u8; image.cmd_line_len as usize + 1];
    mem.read(image.cmd_line, &mut cmdline).unwrap();
    assert_eq!(&cmdline, b"console=ttyS0 root=/dev/ram0\0");

    let mut block = vec![0u8; BOOT_PARAMS_SIZE];
    mem.read(image.boot_info, &mut block).unwrap();
    assert_eq!(&block[0x202..0x206], b"HdrS");
    let params = BootParams::from_bytes(&block).unwrap();
    assert_eq!(params.hdr.version, 0x0204);
    assert_eq!(params.hdr.root_dev, 0x0100);
    assert_eq!(params.hdr.code32_start, load as u32);
    assert_eq!(params.hdr.kernel_alignment, 4 << 20);
    assert_eq!(params.hdr.ramdisk_image as u64, image.boot_module_paddr);
    assert_eq!(params.hdr.ramdisk_size, 0x1800);
    assert_eq!(params.hdr.cmd_line_ptr as u64, image.cmd_line);
    assert_eq!(params.hdr.cmdline_size, image.cmd_line_len);
    assert_eq!(
        params.e820_map,
        vec![
            E820Entry::new(0, LINK_PADDR, E820Type::Reserved),
            E820Entry::new(LINK_PADDR, RAM_SIZE - LINK_PADDR, E820Type::Ram),
            E820Entry::new(RAM_SIZE, (1 << 32) - RAM_SIZE, E820Type::Reserved),
        ]
    );

    let mut regs = UserContext { eax: 0xdead, ..Default::default() };
    boot.init_vcpu(&mut regs).unwrap();
    assert_eq!(regs.eip, load);
    assert_eq!(regs.esi, image.boot_info);
    assert_eq!(regs.eax, 0);

    assert_eq!(mem.vspace.mapped_pages(), 0);
}

#[test]
fn test_boot_at_link_address_ignores_relocs() {
    let mut files = TempFiles(Vec::new());
    let text = kernel_text();
    let kernel = files.write(
        "linked-vmlinux",
        &build_elf32(0x400000, 0xc040_0000, 0x400000, &text, TEXT_SIZE as u32),
    );

    let mut mem = guest_memory();
    let mut boot = GuestBoot::builder()
        .kernel(&kernel)
        .relocs("/nonexistent/vmlinux.relocs")
        .build()
        .unwrap();
    let image = boot.run(&mut mem, &mut NoPlatform).unwrap();

    assert_eq!(image.relocation_offset, 0);
    assert_eq!(image.entry, 0x400000);
    assert!(!image.has_boot_module());
    assert_eq!(mem.read_u32(0x400010).unwrap(), LINK_VADDR + 0x400);
}

#[test]
fn test_kernel_without_relocations() {
    let mut files = TempFiles(Vec::new());
    let kernel = files.write(
        "norelocs-vmlinux",
        &build_elf32(LINK_PADDR as u32, LINK_VADDR, LINK_PADDR as u32, &kernel_text(), TEXT_SIZE as u32),
    );
    let relocs = files.write("empty.relocs", &build_relocs(&[]));

    let mut mem = guest_memory();
    let mut boot = GuestBoot::builder().kernel(&kernel).relocs(&relocs).build().unwrap();
    let err = boot.run(&mut mem, &mut NoPlatform).unwrap_err();

    assert!(matches!(err, Error::RelocationUnsupported));
    assert_eq!(err.kind(), ErrorKind::ConfigurationMismatch);
    assert_eq!(boot.stage(), BootStage::Failed);
}
