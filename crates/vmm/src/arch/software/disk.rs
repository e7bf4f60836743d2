//! A RAM-backed block device.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{BlockDevice, IoError, SECTOR_SIZE};

/// A block device whose sectors live in host memory.
///
/// Counts every sector transfer and can be told to fail reads or writes, which lets tests observe
/// and disturb swap traffic.
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
    sector_count: u64,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl RamDisk {
    /// Creates a zeroed disk of `sector_count` sectors.
    pub fn new(sector_count: u64) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sector_count as usize * SECTOR_SIZE]),
            sector_count,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Returns the number of sectors read so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// Returns the number of sectors written so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// Makes every subsequent read fail with [`IoError::Device`].
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Makes every subsequent write fail with [`IoError::Device`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    fn range(&self, sector: u64) -> Result<core::ops::Range<usize>, IoError> {
        if sector >= self.sector_count {
            return Err(IoError::OutOfRange);
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&self, sector: u64, buffer: &mut [u8]) -> Result<(), IoError> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(IoError::Device);
        }
        let range = self.range(sector)?;
        buffer.copy_from_slice(&self.sectors.lock()[range]);
        self.reads.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buffer: &[u8]) -> Result<(), IoError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(IoError::Device);
        }
        let range = self.range(sector)?;
        self.sectors.lock()[range].copy_from_slice(buffer);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
