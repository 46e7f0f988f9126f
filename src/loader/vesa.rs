//! VESA BIOS Extensions mode information as recorded by the firmware.
//!
//! The record is a 16-byte header followed by the raw VBE controller info
//! block, the raw mode info block and the active mode's protected-mode
//! interface pointer.

use crate::memory::layout::FRAMEBUFFER_ALIGN;
use crate::memory::align_up;

/// Firmware record kind carrying VBE information.
pub const BOOTINFO_HEADER_X86_VBE: u32 = 1;

/// Size of the complete VBE firmware record.
pub const VBE_BOOTINFO_SIZE: usize = 800;

mod offsets {
    pub const MODE_INFO: usize = 16 + 512;
    // Active VBE mode number, followed by the PM interface pointer
    pub const MODE: usize = MODE_INFO + 256;
    pub const INTERFACE_SEG: usize = MODE + 4;
    pub const INTERFACE_OFF: usize = MODE + 8;
    pub const INTERFACE_LEN: usize = MODE + 12;

    // Within the mode info block
    pub const BYTES_PER_SCAN_LINE: usize = 0x10;
    pub const X_RES: usize = 0x12;
    pub const Y_RES: usize = 0x14;
    pub const PLANES: usize = 0x18;
    pub const BITS_PER_PIXEL: usize = 0x19;
    pub const RED_LEN: usize = 0x1f;
    pub const RED_OFF: usize = 0x20;
    pub const GREEN_LEN: usize = 0x21;
    pub const GREEN_OFF: usize = 0x22;
    pub const BLUE_LEN: usize = 0x23;
    pub const BLUE_OFF: usize = 0x24;
    pub const RSVD_LEN: usize = 0x25;
    pub const RSVD_OFF: usize = 0x26;
    pub const PHYS_BASE_PTR: usize = 0x28;
}

/// Fields of the VBE mode info block used to describe a linear framebuffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VbeModeInfo {
    pub bytes_per_scan_line: u16,
    pub x_res: u16,
    pub y_res: u16,
    pub planes: u8,
    pub bits_per_pixel: u8,
    pub red_len: u8,
    pub red_off: u8,
    pub green_len: u8,
    pub green_off: u8,
    pub blue_len: u8,
    pub blue_off: u8,
    pub rsvd_len: u8,
    pub rsvd_off: u8,
    pub phys_base_ptr: u32,
}

/// Decoded VBE firmware record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VbeInfo {
    pub mode_info: VbeModeInfo,
    pub interface_seg: u32,
    pub interface_off: u32,
    pub interface_len: u32,
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl VbeInfo {
    /// Decode a firmware record. Returns `None` if it is truncated.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        use offsets::*;

        if buf.len() < VBE_BOOTINFO_SIZE {
            return None;
        }
        let m = &buf[MODE_INFO..MODE];
        Some(Self {
            mode_info: VbeModeInfo {
                bytes_per_scan_line: u16_at(m, BYTES_PER_SCAN_LINE),
                x_res: u16_at(m, X_RES),
                y_res: u16_at(m, Y_RES),
                planes: m[PLANES],
                bits_per_pixel: m[BITS_PER_PIXEL],
                red_len: m[RED_LEN],
                red_off: m[RED_OFF],
                green_len: m[GREEN_LEN],
                green_off: m[GREEN_OFF],
                blue_len: m[BLUE_LEN],
                blue_off: m[BLUE_OFF],
                rsvd_len: m[RSVD_LEN],
                rsvd_off: m[RSVD_OFF],
                phys_base_ptr: u32_at(m, PHYS_BASE_PTR),
            },
            interface_seg: u32_at(buf, INTERFACE_SEG),
            interface_off: u32_at(buf, INTERFACE_OFF),
            interface_len: u32_at(buf, INTERFACE_LEN),
        })
    }

    /// Linear framebuffer size, rounded up to 64KB.
    pub fn framebuffer_size(&self) -> u64 {
        let raw = self.mode_info.bytes_per_scan_line as u64 * self.mode_info.y_res as u64;
        // At most 0xffff * 0xffff, far from overflowing
        align_up(raw, FRAMEBUFFER_ALIGN).unwrap_or(raw)
    }

    /// Physical address of the protected-mode interface (real-mode seg:off).
    pub fn pm_interface_base(&self) -> u64 {
        ((self.interface_seg as u64) << 4) + self.interface_off as u64
    }
}

/// Encode a record in firmware layout.
#[cfg(test)]
pub(crate) fn encode_vbe_record(info: &VbeInfo) -> Vec<u8> {
    use offsets::*;

    let mut buf = vec![0u8; VBE_BOOTINFO_SIZE];
    buf[0..4].copy_from_slice(&BOOTINFO_HEADER_X86_VBE.to_le_bytes());
    buf[8..12].copy_from_slice(&(VBE_BOOTINFO_SIZE as u32).to_le_bytes());

    let mi = &info.mode_info;
    let m = &mut buf[MODE_INFO..MODE];
    m[BYTES_PER_SCAN_LINE..BYTES_PER_SCAN_LINE + 2].copy_from_slice(&mi.bytes_per_scan_line.to_le_bytes());
    m[X_RES..X_RES + 2].copy_from_slice(&mi.x_res.to_le_bytes());
    m[Y_RES..Y_RES + 2].copy_from_slice(&mi.y_res.to_le_bytes());
    m[PLANES] = mi.planes;
    m[BITS_PER_PIXEL] = mi.bits_per_pixel;
    m[RED_LEN] = mi.red_len;
    m[RED_OFF] = mi.red_off;
    m[GREEN_LEN] = mi.green_len;
    m[GREEN_OFF] = mi.green_off;
    m[BLUE_LEN] = mi.blue_len;
    m[BLUE_OFF] = mi.blue_off;
    m[RSVD_LEN] = mi.rsvd_len;
    m[RSVD_OFF] = mi.rsvd_off;
    m[PHYS_BASE_PTR..PHYS_BASE_PTR + 4].copy_from_slice(&mi.phys_base_ptr.to_le_bytes());

    buf[INTERFACE_SEG..INTERFACE_SEG + 4].copy_from_slice(&info.interface_seg.to_le_bytes());
    buf[INTERFACE_OFF..INTERFACE_OFF + 4].copy_from_slice(&info.interface_off.to_le_bytes());
    buf[INTERFACE_LEN..INTERFACE_LEN + 4].copy_from_slice(&info.interface_len.to_le_bytes());
    buf
}

/// A 1024x768x32 mode with its framebuffer at 0xe0000000.
#[cfg(test)]
pub(crate) fn sample_vbe_info() -> VbeInfo {
    VbeInfo {
        mode_info: VbeModeInfo {
            bytes_per_scan_line: 4096,
            x_res: 1024,
            y_res: 768,
            planes: 1,
            bits_per_pixel: 32,
            red_len: 8,
            red_off: 16,
            green_len: 8,
            green_off: 8,
            blue_len: 8,
            blue_off: 0,
            rsvd_len: 8,
            rsvd_off: 24,
            phys_base_ptr: 0xe000_0000,
        },
        interface_seg: 0xc000,
        interface_off: 0x40,
        interface_len: 0x200,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let info = sample_vbe_info();
        let buf = encode_vbe_record(&info);
        // Spot check raw firmware offsets
        assert_eq!(&buf[528 + 0x12..528 + 0x14], &1024u16.to_le_bytes());
        assert_eq!(&buf[788..792], &0xc000u32.to_le_bytes());
        assert_eq!(VbeInfo::parse(&buf), Some(info));
    }

    #[test]
    fn test_parse_truncated() {
        let buf = encode_vbe_record(&sample_vbe_info());
        assert_eq!(VbeInfo::parse(&buf[..VBE_BOOTINFO_SIZE - 1]), None);
    }

    #[test]
    fn test_framebuffer_size() {
        let mut info = sample_vbe_info();
        assert_eq!(info.framebuffer_size(), 0x300000);

        info.mode_info.bytes_per_scan_line = 2400;
        info.mode_info.y_res = 600;
        // 1440000 bytes rounds up to 22 * 64KB
        assert_eq!(info.framebuffer_size(), 22 * 0x10000);
    }

    #[test]
    fn test_pm_interface_base() {
        let info = sample_vbe_info();
        assert_eq!(info.pm_interface_base(), 0xc0040);
    }
}
