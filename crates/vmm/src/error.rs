//! Error types shared by the pager.

use core::fmt;

use crate::VirtualAddress;

/// Errors reported by the disk and file layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The sector or file offset lies outside the device or file.
    OutOfRange,
    /// The file handle has already been closed.
    Closed,
    /// The device reported a failure.
    Device,
    /// Fewer bytes than requested were transferred.
    ShortTransfer { expected: usize, actual: usize },
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::OutOfRange => write!(f, "offset out of range"),
            IoError::Closed => write!(f, "file handle closed"),
            IoError::Device => write!(f, "device error"),
            IoError::ShortTransfer { expected, actual } => {
                write!(f, "short transfer: {actual} of {expected} bytes")
            }
        }
    }
}

/// Errors that can occur while resolving, mapping or copying pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page is recorded at the address. The caller decides whether to grow a stack or
    /// kill the process.
    NotMapped(VirtualAddress),
    /// The access is not allowed by the page's protection.
    ProtectionViolation(VirtualAddress),
    /// A page already exists at the address.
    AlreadyMapped(VirtualAddress),
    /// The address must be page-aligned.
    Misaligned(VirtualAddress),
    /// A length, offset or file argument is unusable.
    InvalidArgument,
    /// Every frame is held by a page that is being resolved.
    OutOfFrames,
    /// Every swap slot is in use.
    SwapExhausted,
    /// Disk or file I/O failed.
    Io(IoError),
}

impl From<IoError> for VmError {
    fn from(error: IoError) -> Self {
        VmError::Io(error)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::NotMapped(addr) => write!(f, "no page mapped at {addr}"),
            VmError::ProtectionViolation(addr) => write!(f, "protection violation at {addr}"),
            VmError::AlreadyMapped(addr) => write!(f, "page already mapped at {addr}"),
            VmError::Misaligned(addr) => write!(f, "address {addr} is not page-aligned"),
            VmError::InvalidArgument => write!(f, "invalid argument"),
            VmError::OutOfFrames => write!(f, "no evictable frame available"),
            VmError::SwapExhausted => write!(f, "swap space exhausted"),
            VmError::Io(error) => write!(f, "i/o error: {error}"),
        }
    }
}
