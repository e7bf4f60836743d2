//! Victim selection for the frame pool.

use crate::frame::Owner;

/// Chooses which resident page gives up its frame when the pool is empty.
///
/// Implementations must be deterministic and must skip busy entries: a busy page is
/// being faulted in, copied or destroyed on another path and cannot be evicted.
pub trait EvictionPolicy: Send {
    /// Returns the frame index of the victim, or `None` if no frame can be evicted.
    fn select_victim(&mut self, resident: &ResidentSet<'_>) -> Option<usize>;
}

/// A view of the frame table offered to an [`EvictionPolicy`].
///
/// Entries are indexed by frame, relative to the start of the pool.
pub struct ResidentSet<'a> {
    owners: &'a [Option<Owner>],
}

impl<'a> ResidentSet<'a> {
    pub(crate) fn new(owners: &'a [Option<Owner>]) -> Self {
        Self { owners }
    }

    /// Returns the number of frames in the pool.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns true if the pool has no frames.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Returns true if the frame is held by a live page.
    pub fn is_resident(&self, index: usize) -> bool {
        self.owners[index]
            .as_ref()
            .is_some_and(|owner| owner.page.strong_count() > 0)
    }

    /// Returns true if the owning page is locked by another path.
    pub fn is_busy(&self, index: usize) -> bool {
        self.owners[index]
            .as_ref()
            .and_then(|owner| owner.page.upgrade())
            .is_some_and(|page| page.state.is_locked())
    }

    /// Returns whether the page was accessed since the last call, clearing the bit.
    pub fn take_accessed(&self, index: usize) -> bool {
        let Some(owner) = &self.owners[index] else {
            return false;
        };
        let Some(page) = owner.page.upgrade() else {
            return false;
        };

        let accessed = owner.mmu.is_accessed(page.addr());
        if accessed {
            owner.mmu.set_accessed(page.addr(), false);
        }
        accessed
    }
}

/// The second-chance clock algorithm.
///
/// The hand sweeps the frames in order. A page whose accessed bit is set has the bit
/// cleared and is passed over once; the first page found with the bit clear is the
/// victim.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    /// Creates a clock with the hand on the first frame.
    pub const fn new() -> Self {
        Self { hand: 0 }
    }
}

impl EvictionPolicy for Clock {
    fn select_victim(&mut self, resident: &ResidentSet<'_>) -> Option<usize> {
        let len = resident.len();
        if len == 0 {
            return None;
        }

        // Two sweeps: the first may only clear accessed bits.
        for _ in 0..2 * len {
            let index = self.hand % len;
            self.hand = (index + 1) % len;

            if !resident.is_resident(index) || resident.is_busy(index) {
                continue;
            }
            if resident.take_accessed(index) {
                continue;
            }
            return Some(index);
        }

        None
    }
}
