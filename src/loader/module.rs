//! Boot module (initrd) loading.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::image::GuestImage;
use crate::memory::{GuestMemory, GuestVspace, RegionTracker};

/// Load the boot module at `path`.
///
/// See [`load_boot_module_from`].
pub fn load_boot_module<R, V>(
    mem: &mut GuestMemory<R, V>,
    image: &mut GuestImage,
    path: &Path,
) -> Result<()>
where
    R: RegionTracker,
    V: GuestVspace,
{
    let mut file = File::open(path).map_err(|e| Error::open_failed(e, path, Error::ModuleNotFound))?;
    info!("Loading boot module \"{}\"", path.display());
    load_boot_module_from(mem, image, &mut file)
}

/// Copy a boot module to the start of the largest free RAM region and
/// record its location in `image`.
pub fn load_boot_module_from<R, V, F>(
    mem: &mut GuestMemory<R, V>,
    image: &mut GuestImage,
    file: &mut F,
) -> Result<()>
where
    R: RegionTracker,
    V: GuestVspace,
    F: Read + Seek,
{
    let size = file.seek(SeekFrom::End(0))?;
    if size == 0 {
        return Err(Error::EmptyBootModule);
    }
    file.seek(SeekFrom::Start(0))?;

    let load_addr = mem
        .ram
        .largest_free_region_start()
        .ok_or_else(|| Error::OutOfGuestMemory("no free region for the boot module".into()))?;
    info!("Boot module of {} bytes at 0x{:x}", size, load_addr);

    mem.ram.mark_allocated(load_addr, size).map_err(|e| match e {
        Error::OutOfGuestMemory(reason) => Error::OutOfGuestMemory(format!(
            "boot module of {} bytes does not fit at 0x{:x}: {}",
            size, load_addr, reason
        )),
        other => other,
    })?;
    mem.touch(load_addr, size, |chunk| file.read_exact(chunk.data).map_err(Error::from))?;

    image.boot_module_paddr = load_addr;
    image.boot_module_size = size;
    debug!("Guest memory after loading initrd:\n{:?}", mem.ram.ram_regions());
    Ok(())
}
