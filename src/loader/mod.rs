//! Kernel and boot loader functionality.
//!
//! This module loads the guest kernel and its boot module into guest
//! memory, relocates the kernel when it cannot run at its link address,
//! and writes the Linux boot parameter block.

pub mod bootinfo;
pub mod elf;
pub mod module;
pub mod relocs;
pub mod vesa;
pub mod x86_64;

pub use bootinfo::{
    init_guest_boot_structure, make_guest_boot_info, make_guest_cmd_line, make_guest_e820_map,
    make_guest_screen_info,
};
pub use elf::{load_guest_elf, load_guest_elf_from, ElfLayout, ProgramSegment};
pub use module::{load_boot_module, load_boot_module_from};
pub use relocs::{relocate_guest_elf, relocate_guest_elf_from};
