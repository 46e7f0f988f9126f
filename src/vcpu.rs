//! Initial register state of the boot vCPU.

use log::info;

use crate::error::Result;
use crate::image::GuestImage;

/// Registers the boot path touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Eip,
}

/// Write access to a vCPU's register file before it first runs.
pub trait VcpuRegisters {
    fn write_register(&mut self, reg: Register, value: u64) -> Result<()>;
}

/// A plain register file, written back to the hypervisor in one go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserContext {
    pub eax: u64,
    pub ebx: u64,
    pub ecx: u64,
    pub edx: u64,
    pub esi: u64,
    pub eip: u64,
}

impl VcpuRegisters for UserContext {
    fn write_register(&mut self, reg: Register, value: u64) -> Result<()> {
        let slot = match reg {
            Register::Eax => &mut self.eax,
            Register::Ebx => &mut self.ebx,
            Register::Ecx => &mut self.ecx,
            Register::Edx => &mut self.edx,
            Register::Esi => &mut self.esi,
            Register::Eip => &mut self.eip,
        };
        *slot = value;
        Ok(())
    }
}

/// Point the vCPU at the kernel entry with ESI holding the boot
/// parameter block, as the 32-bit Linux boot protocol expects.
pub fn init_guest_thread_state<C: VcpuRegisters + ?Sized>(
    image: &GuestImage,
    regs: &mut C,
) -> Result<()> {
    for reg in [Register::Eax, Register::Ebx, Register::Ecx, Register::Edx] {
        regs.write_register(reg, 0)?;
    }
    regs.write_register(Register::Eip, image.entry)?;
    regs.write_register(Register::Esi, image.boot_info)?;
    info!(
        "Guest entry 0x{:x}, boot info at 0x{:x}",
        image.entry, image.boot_info
    );
    Ok(())
}
