//! Guest boot structures: command line, screen info, e820 map and the
//! boot parameter block that ties them together.

use log::{debug, error, info, warn};

use crate::boot::Platform;
use crate::error::{Error, Result};
use crate::image::GuestImage;
use crate::loader::vesa::{VbeInfo, BOOTINFO_HEADER_X86_VBE, VBE_BOOTINFO_SIZE};
use crate::loader::x86_64::{
    BootParams, E820Entry, E820Type, ScreenInfo, BOOT_PARAMS_SIZE, BOOT_PROTOCOL_2_02,
    BOOT_PROTOCOL_2_04, E820_MAX, LOADER_TYPE_UNDEFINED, RAMDISK_ROOT_DEV, VIDEO_TYPE_VLFB,
};
use crate::memory::layout::{FOUR_GIB, PAGE_SIZE, VBE_PM_LOW_LIMIT};
use crate::memory::{align_down, align_up, GuestMemory, GuestVspace, MemoryRegion, RegionTracker};

/// Write the command line, the boot parameter block and any platform
/// tables into guest memory.
pub fn init_guest_boot_structure<R, V, P>(
    mem: &mut GuestMemory<R, V>,
    image: &mut GuestImage,
    platform: &mut P,
    cmdline: &str,
    vesa_enabled: bool,
) -> Result<()>
where
    R: RegionTracker,
    V: GuestVspace,
    P: Platform,
{
    make_guest_cmd_line(mem, image, cmdline)?;
    make_guest_boot_info(mem, image, platform, vesa_enabled)?;
    platform.make_platform_tables(mem, image)
}

/// Copy `cmdline` and its NUL terminator into freshly allocated guest
/// memory.
pub fn make_guest_cmd_line<R, V>(
    mem: &mut GuestMemory<R, V>,
    image: &mut GuestImage,
    cmdline: &str,
) -> Result<()>
where
    R: RegionTracker,
    V: GuestVspace,
{
    if cmdline.contains('\0') {
        return Err(Error::InvalidConfig("command line contains a NUL byte".into()));
    }
    let len = u32::try_from(cmdline.len())
        .map_err(|_| Error::InvalidConfig(format!("command line of {} bytes", cmdline.len())))?;

    let mut bytes = Vec::with_capacity(cmdline.len() + 1);
    bytes.extend_from_slice(cmdline.as_bytes());
    bytes.push(0);

    let addr = mem.ram.allocate(bytes.len() as u64)?;
    info!("Constructing guest cmdline at 0x{:x} of size {}", addr, bytes.len());
    mem.write(addr, &bytes)?;

    image.cmd_line = addr;
    image.cmd_line_len = len;
    Ok(())
}

/// Describe the VESA framebuffer, or return an all-zero structure if
/// there is none to hand over.
pub fn make_guest_screen_info<P: Platform>(platform: &mut P, enabled: bool) -> ScreenInfo {
    if !enabled {
        return ScreenInfo::default();
    }

    let mut record = [0u8; VBE_BOOTINFO_SIZE];
    let vbe = platform
        .extended_bootinfo(BOOTINFO_HEADER_X86_VBE, &mut record)
        .and_then(|n| VbeInfo::parse(&record[..n.min(record.len())]));
    let Some(vbe) = vbe else {
        warn!("Failed to get VBE information from the platform. Disabling VESA framebuffer");
        return ScreenInfo::default();
    };

    match map_framebuffer(platform, &vbe) {
        Ok(base) => {
            let mi = &vbe.mode_info;
            info!(
                "VESA framebuffer {}x{}x{} at 0x{:x}",
                mi.x_res, mi.y_res, mi.bits_per_pixel, base
            );
            ScreenInfo {
                orig_video_is_vga: VIDEO_TYPE_VLFB,
                lfb_width: mi.x_res,
                lfb_height: mi.y_res,
                lfb_depth: mi.bits_per_pixel as u16,
                lfb_base: base as u32,
                lfb_size: (vbe.framebuffer_size() >> 16) as u32,
                lfb_linelength: mi.bytes_per_scan_line,
                red_size: mi.red_len,
                red_pos: mi.red_off,
                green_size: mi.green_len,
                green_pos: mi.green_off,
                blue_size: mi.blue_len,
                blue_pos: mi.blue_off,
                rsvd_size: mi.rsvd_len,
                rsvd_pos: mi.rsvd_off,
                vesapm_seg: vbe.interface_seg as u16,
                vesapm_off: vbe.interface_off as u16,
                pages: mi.planes as u16,
            }
        }
        Err(e) => {
            error!("{}. Disabling VESA framebuffer", e);
            ScreenInfo::default()
        }
    }
}

/// Map the protected-mode interface, if it lies above the BIOS area, and
/// the linear framebuffer into the guest. Returns the framebuffer's guest
/// address.
fn map_framebuffer<P: Platform>(platform: &mut P, vbe: &VbeInfo) -> Result<u64> {
    let pm_base = vbe.pm_interface_base();
    if pm_base > VBE_PM_LOW_LIMIT {
        let start = align_down(pm_base, PAGE_SIZE);
        let size = align_up(pm_base + vbe.interface_len as u64 - start, PAGE_SIZE)
            .ok_or_else(|| Error::DeviceMapFailed("VBE protected mode interface".into()))?;
        debug!("Mapping VBE protected mode interface 0x{:x}+0x{:x}", start, size);
        platform.map_device_at(start, start, size)?;
    }

    let fb_size = vbe.framebuffer_size();
    let base = platform.map_device(vbe.mode_info.phys_base_ptr as u64, fb_size, PAGE_SIZE)?;
    if base == 0 || base + fb_size > FOUR_GIB {
        return Err(Error::DeviceMapFailed(format!(
            "framebuffer mapped at unusable address 0x{:x}",
            base
        )));
    }
    Ok(base)
}

/// Partition `[0, 4GB)` into RAM and reserved ranges.
///
/// `regions` must be sorted, non-overlapping and below 4GB. Gaps between
/// them, and everything past the last one, are reported reserved.
/// Adjacent entries of the same type are merged.
pub fn make_guest_e820_map(regions: &[MemoryRegion]) -> Result<Vec<E820Entry>> {
    if regions.is_empty() {
        return Err(Error::InvalidRegion {
            start: 0,
            size: 0,
            reason: "no RAM regions to describe",
        });
    }

    let mut map = MemoryMap::default();
    for region in regions {
        if region.start < map.cursor {
            return Err(Error::InvalidRegion {
                start: region.start,
                size: region.size,
                reason: "regions are unsorted or overlapping",
            });
        }
        if region.end() > FOUR_GIB {
            return Err(Error::InvalidRegion {
                start: region.start,
                size: region.size,
                reason: "extends past 4GB",
            });
        }
        map.push(region.start, E820Type::Reserved)?;
        map.push(region.end(), E820Type::Ram)?;
    }
    if map.cursor < FOUR_GIB {
        map.push(FOUR_GIB, E820Type::Reserved)?;
    }

    debug!("Final e820 map is:");
    for entry in &map.entries {
        debug!(
            "\t0x{:x} - 0x{:x} type {:?}",
            entry.addr,
            entry.end(),
            entry.type_
        );
    }
    Ok(map.entries)
}

#[derive(Default)]
struct MemoryMap {
    entries: Vec<E820Entry>,
    cursor: u64,
}

impl MemoryMap {
    /// Extend the map from the cursor to `end` with `type_`.
    fn push(&mut self, end: u64, type_: E820Type) -> Result<()> {
        if end <= self.cursor {
            return Ok(());
        }
        let size = end - self.cursor;
        match self.entries.last_mut() {
            Some(last) if last.type_ == type_ => last.size += size,
            _ => {
                if self.entries.len() == E820_MAX {
                    return Err(Error::E820Overflow(E820_MAX));
                }
                self.entries.push(E820Entry::new(self.cursor, size, type_));
            }
        }
        self.cursor = end;
        Ok(())
    }
}

fn boot_field(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvalidConfig(format!("{} 0x{:x} is above 4GB", what, value)))
}

/// Assemble the boot parameter block and copy it into guest memory.
pub fn make_guest_boot_info<R, V, P>(
    mem: &mut GuestMemory<R, V>,
    image: &mut GuestImage,
    platform: &mut P,
    vesa_enabled: bool,
) -> Result<()>
where
    R: RegionTracker,
    V: GuestVspace,
    P: Platform,
{
    let addr = mem.ram.allocate(BOOT_PARAMS_SIZE as u64)?;
    info!("Guest boot info allocated at 0x{:x}. Populating...", addr);

    let mut params = BootParams::new();
    params.hdr.type_of_loader = LOADER_TYPE_UNDEFINED;
    params.hdr.code32_start = boot_field(image.load_paddr, "kernel load address")?;
    params.hdr.kernel_alignment = boot_field(image.alignment, "kernel alignment")?;
    params.hdr.relocatable_kernel = true;
    params.hdr.cmd_line_ptr = boot_field(image.cmd_line, "command line address")?;
    params.hdr.cmdline_size = image.cmd_line_len;

    if image.has_boot_module() {
        params.hdr.ramdisk_image = boot_field(image.boot_module_paddr, "boot module address")?;
        params.hdr.ramdisk_size = boot_field(image.boot_module_size, "boot module size")?;
        params.hdr.root_dev = RAMDISK_ROOT_DEV;
        params.hdr.version = BOOT_PROTOCOL_2_04;
    } else {
        params.hdr.version = BOOT_PROTOCOL_2_02;
    }

    params.screen_info = make_guest_screen_info(platform, vesa_enabled);
    params.e820_map = make_guest_e820_map(&mem.ram.ram_regions())?;

    let bytes = params
        .to_bytes()
        .ok_or(Error::E820Overflow(E820_MAX))?;
    mem.write(addr, &bytes)?;
    image.boot_info = addr;
    Ok(())
}
