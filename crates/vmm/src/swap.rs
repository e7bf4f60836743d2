//! Swap space for anonymous pages.
//!
//! The swap disk is divided into page-sized slots of [`SECTORS_PER_PAGE`] sectors each.
//! Slot usage is tracked by a bitmap; slot contents are raw page bytes with no header.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::{BlockDevice, PAGE_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE, VmError};

/// A page-sized span of swap sectors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Returns the slot index.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the first disk sector of this slot.
    pub const fn first_sector(self) -> u64 {
        (self.0 * SECTORS_PER_PAGE) as u64
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({})", self.0)
    }
}

/// One bit per slot, set while the slot is in use.
struct Bitmap {
    words: Vec<u64>,
    used: usize,
}

impl Bitmap {
    fn new(bits: usize) -> Self {
        let mut words = vec![0u64; bits.div_ceil(64)];
        // Bits past the end of the last word never exist.
        if bits % 64 != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0 << (bits % 64);
            }
        }
        Self { words, used: 0 }
    }

    fn allocate(&mut self) -> Option<usize> {
        let (index, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = word.trailing_ones() as usize;
        *word |= 1 << bit;
        self.used += 1;
        Some(index * 64 + bit)
    }

    fn free(&mut self, bit: usize) {
        let word = &mut self.words[bit / 64];
        let mask = 1 << (bit % 64);
        assert!(*word & mask != 0, "swap slot {bit} freed while not in use");
        *word &= !mask;
        self.used -= 1;
    }
}

/// The machine-wide swap space.
pub struct SwapSpace {
    disk: Arc<dyn BlockDevice>,
    slot_count: usize,
    slots: Mutex<Bitmap>,
}

impl SwapSpace {
    /// Creates a swap space covering the whole of `disk`.
    ///
    /// Trailing sectors that do not fill a whole slot are left unused.
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        let slot_count = (disk.sector_count() / SECTORS_PER_PAGE as u64) as usize;
        Self {
            disk,
            slot_count,
            slots: Mutex::new(Bitmap::new(slot_count)),
        }
    }

    /// Reserves a free slot.
    pub fn allocate_slot(&self) -> Result<SlotId, VmError> {
        let slot = self.slots.lock().allocate().map(SlotId);
        log::trace!("swap: allocated {slot:?}");
        slot.ok_or(VmError::SwapExhausted)
    }

    /// Writes one page to `slot`.
    pub fn write(&self, slot: SlotId, page: &[u8]) -> Result<(), VmError> {
        assert_eq!(page.len(), PAGE_SIZE, "swap transfers are one page");
        for (index, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.disk
                .write_sector(slot.first_sector() + index as u64, sector)?;
        }
        Ok(())
    }

    /// Reads one page from `slot`.
    pub fn read(&self, slot: SlotId, page: &mut [u8]) -> Result<(), VmError> {
        assert_eq!(page.len(), PAGE_SIZE, "swap transfers are one page");
        for (index, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.disk
                .read_sector(slot.first_sector() + index as u64, sector)?;
        }
        Ok(())
    }

    /// Returns `slot` to the free pool.
    ///
    /// # Panics
    /// Panics if the slot is not in use.
    pub fn free(&self, slot: SlotId) {
        log::trace!("swap: freed {slot:?}");
        self.slots.lock().free(slot.0);
    }

    /// Returns the total number of slots.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Returns the number of slots in use.
    pub fn used_slots(&self) -> usize {
        self.slots.lock().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamDisk;

    fn swap(slots: usize) -> (Arc<RamDisk>, SwapSpace) {
        let disk = Arc::new(RamDisk::new((slots * SECTORS_PER_PAGE) as u64));
        let swap = SwapSpace::new(disk.clone());
        (disk, swap)
    }

    #[test]
    fn slot_count_from_disk_size() {
        let disk = Arc::new(RamDisk::new(3 * SECTORS_PER_PAGE as u64 + 5));
        assert_eq!(SwapSpace::new(disk).slot_count(), 3);
    }

    #[test]
    fn slots_are_first_fit() {
        let (_, swap) = swap(4);
        let a = swap.allocate_slot().unwrap();
        let b = swap.allocate_slot().unwrap();
        assert_eq!((a.as_usize(), b.as_usize()), (0, 1));
        swap.free(a);
        assert_eq!(swap.allocate_slot().unwrap(), a);
        assert_eq!(swap.used_slots(), 2);
    }

    #[test]
    fn exhaustion_does_not_reuse_live_slots() {
        let (_, swap) = swap(70);
        let slots: Vec<_> = (0..70).map(|_| swap.allocate_slot().unwrap()).collect();
        assert_eq!(swap.allocate_slot(), Err(VmError::SwapExhausted));

        let mut indexes: Vec<_> = slots.iter().map(|slot| slot.as_usize()).collect();
        indexes.dedup();
        assert_eq!(indexes, (0..70).collect::<Vec<_>>());
    }

    #[test]
    fn page_round_trip_uses_whole_slot() {
        let (disk, swap) = swap(2);
        let slot = SlotId(1);
        let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        swap.write(slot, &page).unwrap();
        assert_eq!(disk.writes(), SECTORS_PER_PAGE);

        let mut out = vec![0; PAGE_SIZE];
        swap.read(slot, &mut out).unwrap();
        assert_eq!(out, page);
        assert_eq!(disk.reads(), SECTORS_PER_PAGE);
        assert_eq!(slot.first_sector(), SECTORS_PER_PAGE as u64);
    }

    #[test]
    fn write_failure_is_reported() {
        let (disk, swap) = swap(1);
        disk.fail_writes(true);
        assert_eq!(
            swap.write(SlotId(0), &[0; PAGE_SIZE]),
            Err(VmError::Io(crate::IoError::Device))
        );
    }

    #[test]
    #[should_panic(expected = "freed while not in use")]
    fn double_free_panics() {
        let (_, swap) = swap(1);
        let slot = swap.allocate_slot().unwrap();
        swap.free(slot);
        swap.free(slot);
    }
}
