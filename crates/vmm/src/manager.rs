//! The machine-wide memory resources shared by every address space.

use crate::{FramePool, SwapSpace};

/// The frame pool and swap space of the machine.
///
/// Address spaces borrow this for every operation that may allocate a frame or touch
/// swap.
pub struct MemoryManager {
    frames: FramePool,
    swap: SwapSpace,
}

impl MemoryManager {
    /// Creates a memory manager over `frames` and `swap`.
    pub fn new(frames: FramePool, swap: SwapSpace) -> Self {
        log::info!(
            "memory manager: {} frames, {} swap slots",
            frames.total_frames(),
            swap.slot_count()
        );
        Self { frames, swap }
    }

    /// Creates a memory manager backed by emulated memory and a RAM disk.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(frames: usize, swap_slots: usize) -> Self {
        use alloc::sync::Arc;

        use crate::{PAGE_SIZE, PhysicalAddress, PhysicalMemory, RamDisk, SECTORS_PER_PAGE};

        // One spare frame at the bottom keeps physical address zero out of the pool.
        let memory = PhysicalMemory::emulated((frames + 1) * PAGE_SIZE);
        let pool = FramePool::new(memory, PhysicalAddress::new(PAGE_SIZE), frames);
        let disk = Arc::new(RamDisk::new((swap_slots * SECTORS_PER_PAGE) as u64));
        Self::new(pool, SwapSpace::new(disk))
    }

    /// Returns the frame pool.
    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    /// Returns the swap space.
    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }
}
