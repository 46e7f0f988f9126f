//! # guestboot
//!
//! Loads a 32-bit x86 Linux guest kernel into guest physical memory and
//! prepares it to run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use guestboot::{GuestBoot, GuestMemory, GuestRam, GuestRamRegions, NoPlatform, Result};
//!
//! fn main() -> Result<()> {
//!     let ram = GuestRam::new(0, 128 << 20)?;
//!     let mut regions = GuestRamRegions::new();
//!     regions.add_ram(0x100000, (128 << 20) - 0x100000)?;
//!     let mut mem = GuestMemory::new(regions, ram);
//!
//!     let mut boot = GuestBoot::builder()
//!         .kernel("/path/to/vmlinux")
//!         .cmdline("console=ttyS0")
//!         .build()?;
//!     let image = boot.run(&mut mem, &mut NoPlatform)?;
//!     println!("entry 0x{:x}", image.entry);
//!     Ok(())
//! }
//! ```
//!
//! ## Boot sequence
//!
//! 1. Load the kernel's `PT_LOAD` segments into the largest free RAM region.
//! 2. Relocate the kernel if it landed away from its link address.
//! 3. Load the initrd, if any.
//! 4. Write the command line and the boot parameter block (e820 map,
//!    VESA framebuffer).
//! 5. Point the boot vCPU at the entry with ESI holding the boot info.
//!
//! Progress is reported through the [`log`] facade.

mod boot;
mod builder;
mod error;
mod image;
mod vcpu;

pub mod loader;
pub mod memory;

// Re-exports
pub use boot::{BootStage, GuestBoot, NoPlatform, Platform};
pub use builder::{GuestBootBuilder, DEFAULT_ALIGNMENT};
pub use error::{Error, ErrorKind, Result};
pub use image::{GuestImage, LoadedSegment};
pub use memory::{GuestMemory, GuestRam, GuestRamRegions, GuestVspace, MemoryRegion, RegionTracker};
pub use vcpu::{init_guest_thread_state, Register, UserContext, VcpuRegisters};
