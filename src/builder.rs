//! Builder for configuring a guest kernel boot.

use std::path::PathBuf;

use crate::boot::{BootConfig, GuestBoot};
use crate::error::{Error, Result};

/// Default kernel load alignment, matching CONFIG_PHYSICAL_ALIGN.
pub const DEFAULT_ALIGNMENT: u64 = 4 << 20;

/// Builder for creating a [`GuestBoot`].
///
/// # Example
///
/// ```rust,no_run
/// use guestboot::GuestBoot;
///
/// let boot = GuestBoot::builder()
///     .kernel("/path/to/vmlinux")
///     .relocs("/path/to/vmlinux.relocs")
///     .initrd("/path/to/initrd.img")
///     .cmdline("console=ttyS0")
///     .build()?;
/// # Ok::<(), guestboot::Error>(())
/// ```
#[derive(Default)]
pub struct GuestBootBuilder {
    kernel: Option<PathBuf>,
    relocs: Option<PathBuf>,
    initrd: Option<PathBuf>,
    cmdline: Option<String>,
    alignment: Option<u64>,
    vesa_framebuffer: bool,
}

impl GuestBootBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path to the guest kernel ELF image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel = Some(path.into());
        self
    }

    /// Set the path to the kernel's relocation table.
    ///
    /// Only read if the kernel cannot be loaded at its link address.
    pub fn relocs(mut self, path: impl Into<PathBuf>) -> Self {
        self.relocs = Some(path.into());
        self
    }

    /// Set the path to the initial ramdisk (initrd).
    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.initrd = Some(path.into());
        self
    }

    /// Set the kernel command line.
    pub fn cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = Some(cmdline.into());
        self
    }

    /// Set the kernel load alignment.
    ///
    /// Default: 4 MB
    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Hand the firmware's VESA framebuffer to the guest.
    ///
    /// Default: false
    pub fn vesa_framebuffer(mut self, enabled: bool) -> Self {
        self.vesa_framebuffer = enabled;
        self
    }

    /// Validate the configuration and create the boot sequence.
    pub fn build(self) -> Result<GuestBoot> {
        let kernel = self
            .kernel
            .ok_or_else(|| Error::InvalidConfig("no kernel image given".into()))?;
        if !kernel.exists() {
            return Err(Error::KernelNotFound(kernel));
        }

        let alignment = self.alignment.unwrap_or(DEFAULT_ALIGNMENT);
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "load alignment 0x{:x} is not a power of two",
                alignment
            )));
        }

        if let Some(ref initrd) = self.initrd {
            if !initrd.exists() {
                return Err(Error::ModuleNotFound(initrd.clone()));
            }
        }

        let cmdline = self.cmdline.unwrap_or_default();
        if cmdline.contains('\0') {
            return Err(Error::InvalidConfig("command line contains a NUL byte".into()));
        }

        Ok(GuestBoot::new(BootConfig {
            kernel,
            relocs: self.relocs,
            initrd: self.initrd,
            cmdline,
            alignment,
            vesa_framebuffer: self.vesa_framebuffer,
        }))
    }
}
