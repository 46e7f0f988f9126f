//! Boot sequence orchestration.

use std::path::PathBuf;

use log::info;

use crate::builder::GuestBootBuilder;
use crate::error::{Error, Result};
use crate::image::GuestImage;
use crate::loader::{init_guest_boot_structure, load_boot_module, load_guest_elf, relocate_guest_elf};
use crate::memory::{GuestMemory, GuestVspace, RegionTracker};
use crate::vcpu::{init_guest_thread_state, VcpuRegisters};

/// Services the host platform provides to the boot path.
///
/// Every method has a default for platforms without the feature, so a
/// platform without firmware or graphics implements nothing.
pub trait Platform {
    /// Copy the firmware boot info record of `kind` into `buf`. Returns
    /// the number of bytes copied, or `None` if there is no such record.
    fn extended_bootinfo(&self, _kind: u32, _buf: &mut [u8]) -> Option<usize> {
        None
    }

    /// Map device memory at `paddr` to guest physical `gpa`.
    fn map_device_at(&mut self, gpa: u64, _paddr: u64, _size: u64) -> Result<()> {
        Err(Error::DeviceMapFailed(format!("cannot map device memory at 0x{:x}", gpa)))
    }

    /// Map device memory at `paddr` anywhere suitably aligned in the guest.
    /// Returns the guest physical address chosen.
    fn map_device(&mut self, paddr: u64, _size: u64, _align: u64) -> Result<u64> {
        Err(Error::DeviceMapFailed(format!("cannot map device memory 0x{:x}", paddr)))
    }

    /// Build firmware tables (ACPI and the like) once the boot info exists.
    fn make_platform_tables<R, V>(
        &mut self,
        _mem: &mut GuestMemory<R, V>,
        _image: &GuestImage,
    ) -> Result<()>
    where
        R: RegionTracker,
        V: GuestVspace,
    {
        Ok(())
    }
}

/// A platform with no firmware records, devices or tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlatform;

impl Platform for NoPlatform {}

/// Progress through the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    /// Nothing loaded yet.
    Created,
    /// Kernel segments are in guest memory.
    KernelLoaded,
    /// Kernel relocated, or found at its link address.
    Relocated,
    /// Boot module loaded, if one was configured.
    ModuleLoaded,
    /// Command line and boot info written; ready to seed the vCPU.
    Configured,
    /// A stage failed; guest memory contents are undefined.
    Failed,
}

impl std::fmt::Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootStage::Created => write!(f, "created"),
            BootStage::KernelLoaded => write!(f, "kernel loaded"),
            BootStage::Relocated => write!(f, "relocated"),
            BootStage::ModuleLoaded => write!(f, "module loaded"),
            BootStage::Configured => write!(f, "configured"),
            BootStage::Failed => write!(f, "failed"),
        }
    }
}

/// Validated boot inputs.
#[derive(Debug, Clone)]
pub(crate) struct BootConfig {
    pub kernel: PathBuf,
    pub relocs: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    pub alignment: u64,
    pub vesa_framebuffer: bool,
}

/// Boots one guest kernel into guest memory.
///
/// Stages must run in order; [`GuestBoot::run`] runs them all.
///
/// # Example
///
/// ```rust,no_run
/// use guestboot::{GuestBoot, GuestMemory, GuestRam, GuestRamRegions, NoPlatform, UserContext};
///
/// let ram = GuestRam::new(0, 256 << 20)?;
/// let mut regions = GuestRamRegions::new();
/// regions.add_ram(0x100000, (256 << 20) - 0x100000)?;
/// let mut mem = GuestMemory::new(regions, ram);
///
/// let mut boot = GuestBoot::builder()
///     .kernel("/path/to/vmlinux")
///     .relocs("/path/to/vmlinux.relocs")
///     .cmdline("console=ttyS0")
///     .build()?;
/// boot.run(&mut mem, &mut NoPlatform)?;
///
/// let mut regs = UserContext::default();
/// boot.init_vcpu(&mut regs)?;
/// # Ok::<(), guestboot::Error>(())
/// ```
#[derive(Debug)]
pub struct GuestBoot {
    config: BootConfig,
    stage: BootStage,
    image: GuestImage,
}

impl GuestBoot {
    /// Create a new boot builder.
    pub fn builder() -> GuestBootBuilder {
        GuestBootBuilder::new()
    }

    pub(crate) fn new(config: BootConfig) -> Self {
        Self {
            config,
            stage: BootStage::Created,
            image: GuestImage::default(),
        }
    }

    /// Get the current stage.
    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// Get the image layout built so far.
    pub fn image(&self) -> &GuestImage {
        &self.image
    }

    fn expect_stage(&self, expected: BootStage) -> Result<()> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(Error::InvalidStage {
                expected: expected.to_string(),
                actual: self.stage.to_string(),
            })
        }
    }

    fn advance<T>(&mut self, next: BootStage, result: Result<T>) -> Result<T> {
        self.stage = if result.is_ok() { next } else { BootStage::Failed };
        result
    }

    /// Load the kernel ELF into the largest free RAM region.
    pub fn load_kernel<R, V>(&mut self, mem: &mut GuestMemory<R, V>) -> Result<()>
    where
        R: RegionTracker,
        V: GuestVspace,
    {
        self.expect_stage(BootStage::Created)?;
        let result = load_guest_elf(mem, &self.config.kernel, self.config.alignment)
            .map(|image| self.image = image);
        self.advance(BootStage::KernelLoaded, result)
    }

    /// Apply the relocation table if the kernel did not land at its link
    /// address. Returns the number of relocations applied.
    pub fn relocate<R, V>(&mut self, mem: &mut GuestMemory<R, V>) -> Result<usize>
    where
        R: RegionTracker,
        V: GuestVspace,
    {
        self.expect_stage(BootStage::KernelLoaded)?;
        let result = match (&self.config.relocs, self.image.needs_relocation()) {
            (_, false) => Ok(0),
            (None, true) => Err(Error::RelocationUnsupported),
            (Some(path), true) => relocate_guest_elf(mem, &self.image, path),
        };
        self.advance(BootStage::Relocated, result)
    }

    /// Load the initrd, if one was configured.
    pub fn load_module<R, V>(&mut self, mem: &mut GuestMemory<R, V>) -> Result<()>
    where
        R: RegionTracker,
        V: GuestVspace,
    {
        self.expect_stage(BootStage::Relocated)?;
        let result = match &self.config.initrd {
            Some(path) => load_boot_module(mem, &mut self.image, path),
            None => Ok(()),
        };
        self.advance(BootStage::ModuleLoaded, result)
    }

    /// Write the command line, boot parameter block and platform tables.
    pub fn configure<R, V, P>(&mut self, mem: &mut GuestMemory<R, V>, platform: &mut P) -> Result<()>
    where
        R: RegionTracker,
        V: GuestVspace,
        P: Platform,
    {
        self.expect_stage(BootStage::ModuleLoaded)?;
        let result = init_guest_boot_structure(
            mem,
            &mut self.image,
            platform,
            &self.config.cmdline,
            self.config.vesa_framebuffer,
        );
        self.advance(BootStage::Configured, result)
    }

    /// Run every stage in order.
    pub fn run<R, V, P>(&mut self, mem: &mut GuestMemory<R, V>, platform: &mut P) -> Result<&GuestImage>
    where
        R: RegionTracker,
        V: GuestVspace,
        P: Platform,
    {
        self.load_kernel(mem)?;
        let relocations = self.relocate(mem)?;
        self.load_module(mem)?;
        self.configure(mem, platform)?;
        info!(
            "Guest kernel ready: entry 0x{:x}, {} relocations applied",
            self.image.entry, relocations
        );
        Ok(&self.image)
    }

    /// Seed the boot vCPU's registers.
    pub fn init_vcpu<C: VcpuRegisters + ?Sized>(&self, regs: &mut C) -> Result<()> {
        self.expect_stage(BootStage::Configured)?;
        init_guest_thread_state(&self.image, regs)
    }
}
