//! x86 Linux boot parameter block ("zero page").
//!
//! The block is 4KB with fields at fixed offsets given by the Linux boot
//! protocol (Documentation/x86/boot.rst and zero-page.rst). Everything
//! here is serialized field by field into little-endian bytes; no host
//! struct layout is relied on.

/// Size of the boot parameter block.
pub const BOOT_PARAMS_SIZE: usize = 0x1000;

/// Slots in the embedded e820 table.
pub const E820_MAX: usize = 128;

/// `hdr.header` magic, "HdrS".
pub const HDRS_MAGIC: u32 = 0x5372_6448;

/// `hdr.boot_flag` magic.
pub const BOOT_FLAG_MAGIC: u16 = 0xAA55;

/// `hdr.type_of_loader` for a loader without an assigned ID.
pub const LOADER_TYPE_UNDEFINED: u8 = 0xFF;

/// Protocol 2.02: command line pointer, no ramdisk fields.
pub const BOOT_PROTOCOL_2_02: u16 = 0x0202;

/// Protocol 2.04: the kernel honours `ramdisk_image`/`ramdisk_size`.
pub const BOOT_PROTOCOL_2_04: u16 = 0x0204;

/// `hdr.root_dev` pointing at the initial ramdisk (/dev/ram0).
pub const RAMDISK_ROOT_DEV: u16 = 0x0100;

/// `screen_info.orig_video_isVGA` for a VESA linear framebuffer.
pub const VIDEO_TYPE_VLFB: u8 = 0x23;

/// Boot params structure offsets (Linux boot protocol).
pub mod boot_params {
    pub const SCREEN_INFO: usize = 0x000;
    pub const ALT_MEM_K: usize = 0x1e0;
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const ROOT_DEV: usize = 0x1fc;
    pub const BOOT_FLAG: usize = 0x1fe;
    pub const HEADER: usize = 0x202;
    pub const VERSION: usize = 0x206;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const CODE32_START: usize = 0x214;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const KERNEL_ALIGNMENT: usize = 0x230;
    pub const RELOCATABLE_KERNEL: usize = 0x234;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const E820_TABLE: usize = 0x2d0;
}

/// Screen info offsets, relative to the start of the block.
pub mod screen_info {
    pub const SIZE: usize = 0x40;
    pub const ORIG_VIDEO_IS_VGA: usize = 0x0f;
    pub const LFB_WIDTH: usize = 0x12;
    pub const LFB_HEIGHT: usize = 0x14;
    pub const LFB_DEPTH: usize = 0x16;
    pub const LFB_BASE: usize = 0x18;
    pub const LFB_SIZE: usize = 0x1c;
    pub const LFB_LINELENGTH: usize = 0x24;
    pub const RED_SIZE: usize = 0x26;
    pub const RED_POS: usize = 0x27;
    pub const GREEN_SIZE: usize = 0x28;
    pub const GREEN_POS: usize = 0x29;
    pub const BLUE_SIZE: usize = 0x2a;
    pub const BLUE_POS: usize = 0x2b;
    pub const RSVD_SIZE: usize = 0x2c;
    pub const RSVD_POS: usize = 0x2d;
    pub const VESAPM_SEG: usize = 0x2e;
    pub const VESAPM_OFF: usize = 0x30;
    pub const PAGES: usize = 0x32;
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// E820 memory map entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum E820Type {
    Ram = 1,
    Reserved = 2,
}

impl E820Type {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(E820Type::Ram),
            2 => Some(E820Type::Reserved),
            _ => None,
        }
    }
}

/// E820 memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub type_: E820Type,
}

impl E820Entry {
    pub const SIZE: usize = 20;

    pub fn new(addr: u64, size: u64, type_: E820Type) -> Self {
        Self { addr, size, type_ }
    }

    /// First address past the entry.
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        put_u64(&mut bytes, 0, self.addr);
        put_u64(&mut bytes, 8, self.size);
        put_u32(&mut bytes, 16, self.type_ as u32);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            addr: get_u64(bytes, 0),
            size: get_u64(bytes, 8),
            type_: E820Type::from_u32(get_u32(bytes, 16))?,
        })
    }
}

/// VESA framebuffer description handed to the guest.
///
/// The all-zero value tells the kernel there is no graphics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScreenInfo {
    pub orig_video_is_vga: u8,
    pub lfb_width: u16,
    pub lfb_height: u16,
    pub lfb_depth: u16,
    pub lfb_base: u32,
    /// Framebuffer size in 64KB units
    pub lfb_size: u32,
    pub lfb_linelength: u16,
    pub red_size: u8,
    pub red_pos: u8,
    pub green_size: u8,
    pub green_pos: u8,
    pub blue_size: u8,
    pub blue_pos: u8,
    pub rsvd_size: u8,
    pub rsvd_pos: u8,
    pub vesapm_seg: u16,
    pub vesapm_off: u16,
    pub pages: u16,
}

impl ScreenInfo {
    fn write_to(&self, buf: &mut [u8]) {
        use screen_info::*;
        buf[ORIG_VIDEO_IS_VGA] = self.orig_video_is_vga;
        put_u16(buf, LFB_WIDTH, self.lfb_width);
        put_u16(buf, LFB_HEIGHT, self.lfb_height);
        put_u16(buf, LFB_DEPTH, self.lfb_depth);
        put_u32(buf, LFB_BASE, self.lfb_base);
        put_u32(buf, LFB_SIZE, self.lfb_size);
        put_u16(buf, LFB_LINELENGTH, self.lfb_linelength);
        buf[RED_SIZE] = self.red_size;
        buf[RED_POS] = self.red_pos;
        buf[GREEN_SIZE] = self.green_size;
        buf[GREEN_POS] = self.green_pos;
        buf[BLUE_SIZE] = self.blue_size;
        buf[BLUE_POS] = self.blue_pos;
        buf[RSVD_SIZE] = self.rsvd_size;
        buf[RSVD_POS] = self.rsvd_pos;
        put_u16(buf, VESAPM_SEG, self.vesapm_seg);
        put_u16(buf, VESAPM_OFF, self.vesapm_off);
        put_u16(buf, PAGES, self.pages);
    }

    fn read_from(buf: &[u8]) -> Self {
        use screen_info::*;
        Self {
            orig_video_is_vga: buf[ORIG_VIDEO_IS_VGA],
            lfb_width: get_u16(buf, LFB_WIDTH),
            lfb_height: get_u16(buf, LFB_HEIGHT),
            lfb_depth: get_u16(buf, LFB_DEPTH),
            lfb_base: get_u32(buf, LFB_BASE),
            lfb_size: get_u32(buf, LFB_SIZE),
            lfb_linelength: get_u16(buf, LFB_LINELENGTH),
            red_size: buf[RED_SIZE],
            red_pos: buf[RED_POS],
            green_size: buf[GREEN_SIZE],
            green_pos: buf[GREEN_POS],
            blue_size: buf[BLUE_SIZE],
            blue_pos: buf[BLUE_POS],
            rsvd_size: buf[RSVD_SIZE],
            rsvd_pos: buf[RSVD_POS],
            vesapm_seg: get_u16(buf, VESAPM_SEG),
            vesapm_off: get_u16(buf, VESAPM_OFF),
            pages: get_u16(buf, PAGES),
        }
    }
}

/// The setup header fields this loader fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupHeader {
    pub root_dev: u16,
    pub boot_flag: u16,
    pub header: u32,
    pub version: u16,
    pub type_of_loader: u8,
    pub code32_start: u32,
    pub ramdisk_image: u32,
    pub ramdisk_size: u32,
    pub cmd_line_ptr: u32,
    pub kernel_alignment: u32,
    pub relocatable_kernel: bool,
    pub cmdline_size: u32,
}

impl Default for SetupHeader {
    fn default() -> Self {
        Self {
            root_dev: 0,
            boot_flag: BOOT_FLAG_MAGIC,
            header: HDRS_MAGIC,
            version: 0,
            type_of_loader: 0,
            code32_start: 0,
            ramdisk_image: 0,
            ramdisk_size: 0,
            cmd_line_ptr: 0,
            kernel_alignment: 0,
            relocatable_kernel: false,
            cmdline_size: 0,
        }
    }
}

/// The boot parameter block, built in host memory and copied into the
/// guest in one write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootParams {
    pub screen_info: ScreenInfo,
    pub alt_mem_k: u32,
    pub e820_map: Vec<E820Entry>,
    pub hdr: SetupHeader,
}

impl BootParams {
    /// An otherwise zeroed block carrying both protocol magics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize into the 4KB wire layout.
    ///
    /// Returns `None` if the e820 map has more than [`E820_MAX`] entries.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        use boot_params::*;

        if self.e820_map.len() > E820_MAX {
            return None;
        }

        let mut buf = vec![0u8; BOOT_PARAMS_SIZE];
        self.screen_info.write_to(&mut buf[SCREEN_INFO..SCREEN_INFO + screen_info::SIZE]);
        put_u32(&mut buf, ALT_MEM_K, self.alt_mem_k);

        buf[E820_ENTRIES] = self.e820_map.len() as u8;
        for (i, entry) in self.e820_map.iter().enumerate() {
            let at = E820_TABLE + i * E820Entry::SIZE;
            buf[at..at + E820Entry::SIZE].copy_from_slice(&entry.to_bytes());
        }

        let hdr = &self.hdr;
        put_u16(&mut buf, ROOT_DEV, hdr.root_dev);
        put_u16(&mut buf, BOOT_FLAG, hdr.boot_flag);
        put_u32(&mut buf, HEADER, hdr.header);
        put_u16(&mut buf, VERSION, hdr.version);
        buf[TYPE_OF_LOADER] = hdr.type_of_loader;
        put_u32(&mut buf, CODE32_START, hdr.code32_start);
        put_u32(&mut buf, RAMDISK_IMAGE, hdr.ramdisk_image);
        put_u32(&mut buf, RAMDISK_SIZE, hdr.ramdisk_size);
        put_u32(&mut buf, CMD_LINE_PTR, hdr.cmd_line_ptr);
        put_u32(&mut buf, KERNEL_ALIGNMENT, hdr.kernel_alignment);
        buf[RELOCATABLE_KERNEL] = hdr.relocatable_kernel as u8;
        put_u32(&mut buf, CMDLINE_SIZE, hdr.cmdline_size);

        Some(buf)
    }

    /// Parse a block previously produced by [`BootParams::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        use boot_params::*;

        if buf.len() < BOOT_PARAMS_SIZE {
            return None;
        }
        let entries = buf[E820_ENTRIES] as usize;
        if entries > E820_MAX {
            return None;
        }
        let e820_map = (0..entries)
            .map(|i| E820Entry::from_bytes(&buf[E820_TABLE + i * E820Entry::SIZE..]))
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            screen_info: ScreenInfo::read_from(&buf[SCREEN_INFO..SCREEN_INFO + screen_info::SIZE]),
            alt_mem_k: get_u32(buf, ALT_MEM_K),
            e820_map,
            hdr: SetupHeader {
                root_dev: get_u16(buf, ROOT_DEV),
                boot_flag: get_u16(buf, BOOT_FLAG),
                header: get_u32(buf, HEADER),
                version: get_u16(buf, VERSION),
                type_of_loader: buf[TYPE_OF_LOADER],
                code32_start: get_u32(buf, CODE32_START),
                ramdisk_image: get_u32(buf, RAMDISK_IMAGE),
                ramdisk_size: get_u32(buf, RAMDISK_SIZE),
                cmd_line_ptr: get_u32(buf, CMD_LINE_PTR),
                kernel_alignment: get_u32(buf, KERNEL_ALIGNMENT),
                relocatable_kernel: buf[RELOCATABLE_KERNEL] != 0,
                cmdline_size: get_u32(buf, CMDLINE_SIZE),
            },
        })
    }
}
