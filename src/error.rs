//! Error types for guestboot.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using guestboot's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of boot errors.
///
/// Every error is terminal to VM construction; the kind only tells the
/// operator what to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An input file is missing.
    NotFound,
    /// An input file or region table is corrupt.
    MalformedInput,
    /// Guest memory or a fixed-size table ran out.
    ResourceExhausted,
    /// The kernel and its configuration do not match.
    ConfigurationMismatch,
    /// Host I/O failed.
    Io,
}

/// Errors that can occur while booting a guest kernel.
#[derive(Error, Debug)]
pub enum Error {
    // Missing inputs
    #[error("kernel not found: {0}")]
    KernelNotFound(PathBuf),

    #[error("relocation table not found: {0}")]
    RelocsNotFound(PathBuf),

    #[error("boot module not found: {0}")]
    ModuleNotFound(PathBuf),

    // Malformed inputs
    #[error("invalid kernel format: {0}")]
    InvalidKernel(String),

    #[error("invalid relocation table: {0}")]
    InvalidRelocs(String),

    #[error("relocation 0x{vaddr:x} lies below the kernel link base 0x{link_vaddr:x}")]
    RelocationBelowLinkBase { vaddr: u32, link_vaddr: u64 },

    #[error("relocation 0x{vaddr:x} targets 0x{paddr:x}, outside every loaded segment")]
    RelocationOutOfImage { vaddr: u32, paddr: u64 },

    #[error("boot module has zero size")]
    EmptyBootModule,

    #[error("invalid RAM region 0x{start:x}+0x{size:x}: {reason}")]
    InvalidRegion {
        start: u64,
        size: u64,
        reason: &'static str,
    },

    // Exhausted resources
    #[error("out of guest memory: {0}")]
    OutOfGuestMemory(String),

    #[error("e820 map needs more than {0} entries")]
    E820Overflow(usize),

    #[error("no backing page for guest address 0x{0:x}")]
    UnbackedGuestPage(u64),

    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("device mapping failed: {0}")]
    DeviceMapFailed(String),

    // Configuration mismatches
    #[error(
        "kernel relocation is required but no usable 32-bit relocations were found; \
         rebuild the guest kernel with CONFIG_RELOCATABLE and supply its relocs file"
    )]
    RelocationUnsupported,

    #[error("invalid boot configuration: {0}")]
    InvalidConfig(String),

    #[error("boot sequence not in expected stage: expected {expected}, got {actual}")]
    InvalidStage { expected: String, actual: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::KernelNotFound(_) | Error::RelocsNotFound(_) | Error::ModuleNotFound(_) => {
                ErrorKind::NotFound
            }
            Error::InvalidKernel(_)
            | Error::InvalidRelocs(_)
            | Error::RelocationBelowLinkBase { .. }
            | Error::RelocationOutOfImage { .. }
            | Error::EmptyBootModule
            | Error::InvalidRegion { .. } => ErrorKind::MalformedInput,
            Error::OutOfGuestMemory(_)
            | Error::E820Overflow(_)
            | Error::UnbackedGuestPage(_)
            | Error::MemoryAllocationFailed(_)
            | Error::DeviceMapFailed(_) => ErrorKind::ResourceExhausted,
            Error::RelocationUnsupported
            | Error::InvalidConfig(_)
            | Error::InvalidStage { .. } => ErrorKind::ConfigurationMismatch,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Map a failed `open` onto the matching not-found error.
    pub(crate) fn open_failed(
        err: std::io::Error,
        path: &std::path::Path,
        not_found: fn(PathBuf) -> Error,
    ) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            not_found(path.to_path_buf())
        } else {
            Error::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::KernelNotFound("vmlinux".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::E820Overflow(128).kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Error::RelocationUnsupported.kind(), ErrorKind::ConfigurationMismatch);
        assert_eq!(
            Error::RelocationBelowLinkBase { vaddr: 0x10, link_vaddr: 0x100000 }.kind(),
            ErrorKind::MalformedInput
        );
    }

    #[test]
    fn test_open_failed_maps_not_found() {
        let path = std::path::Path::new("/nonexistent/bzImage");
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err = Error::open_failed(io, path, Error::KernelNotFound);
        assert!(matches!(err, Error::KernelNotFound(p) if p == path));

        let io = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = Error::open_failed(io, path, Error::KernelNotFound);
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
