//! The sector-addressed disk interface used for swap.

use crate::{IoError, arch};

/// Size of one disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors holding one page.
pub const SECTORS_PER_PAGE: usize = arch::PAGE_SIZE / SECTOR_SIZE;

/// A block device addressed by absolute sector number.
///
/// Transfers are synchronous and move exactly one [`SECTOR_SIZE`] buffer.
pub trait BlockDevice: Send + Sync {
    /// Returns the capacity of the device in sectors.
    fn sector_count(&self) -> u64;

    /// Reads one sector into `buffer`.
    fn read_sector(&self, sector: u64, buffer: &mut [u8]) -> Result<(), IoError>;

    /// Writes one sector from `buffer`.
    fn write_sector(&self, sector: u64, buffer: &[u8]) -> Result<(), IoError>;
}
