//! The bounded pool of physical frames backing user pages.
//!
//! Every frame handed out is owned by exactly one resident page. When the pool runs
//! dry, an [`EvictionPolicy`] picks a resident page whose contents are pushed out to
//! swap or back to its file, and that page's frame is handed to the new owner.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::{
    Clock, EvictionPolicy, FrameNumber, Mmu, PAGE_SIZE, PhysicalAddress, PhysicalMemory,
    ResidentSet, SwapSpace, VirtualAddress, VmError, page::Page,
};

/// A physical frame owned by a single page.
///
/// Frames cannot be copied. The only way to create one is [`FramePool::allocate`] and
/// the only way to get rid of one is to hand it back to the pool, so a frame is
/// released at most once.
pub struct Frame {
    number: FrameNumber,
}

impl Frame {
    /// Returns the frame number.
    pub fn number(&self) -> FrameNumber {
        self.number
    }

    /// Returns the physical address of the start of the frame.
    pub fn address(&self) -> PhysicalAddress {
        self.number.start()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.address())
    }
}

/// How many times [`FramePool::allocate`] rescans a pool whose pages are all locked.
const EVICTION_RESCANS: usize = 1 << 20;

/// The page currently holding a frame.
pub(crate) struct Owner {
    pub(crate) page: Weak<Page>,
    pub(crate) mmu: Arc<dyn Mmu>,
}

impl Owner {
    pub(crate) fn new(page: &Arc<Page>, mmu: &Arc<dyn Mmu>) -> Self {
        Self {
            page: Arc::downgrade(page),
            mmu: mmu.clone(),
        }
    }
}

struct FrameTable {
    free: Vec<FrameNumber>,
    /// Indexed by frame number relative to the pool base.
    owners: Vec<Option<Owner>>,
    policy: Box<dyn EvictionPolicy>,
}

/// A fixed set of physical frames with eviction.
pub struct FramePool {
    memory: PhysicalMemory,
    base: FrameNumber,
    count: usize,
    table: Mutex<FrameTable>,
}

impl FramePool {
    /// Creates a pool of `count` frames starting at `base`, recycled by a [`Clock`].
    pub fn new(memory: PhysicalMemory, base: PhysicalAddress, count: usize) -> Self {
        Self::with_policy(memory, base, count, Box::new(Clock::new()))
    }

    /// Creates a pool of `count` frames starting at `base` with a custom eviction policy.
    ///
    /// # Panics
    /// Panics if `base` is not page-aligned.
    pub fn with_policy(
        memory: PhysicalMemory,
        base: PhysicalAddress,
        count: usize,
        policy: Box<dyn EvictionPolicy>,
    ) -> Self {
        assert!(base.is_page_aligned(), "frame pool base must be page-aligned");
        let base = base.frame_number();

        // Popped from the back, so hand out the lowest frames first.
        let free = (0..count).rev().map(|index| base + index).collect();
        let owners = (0..count).map(|_| None).collect();

        Self {
            memory,
            base,
            count,
            table: Mutex::new(FrameTable {
                free,
                owners,
                policy,
            }),
        }
    }

    /// Hands out a frame for `owner`, evicting a resident page if none are free.
    ///
    /// If every resident page is momentarily locked, the pool lock is dropped and the scan
    /// repeated, so a busy page only delays the caller. [`VmError::OutOfFrames`] is
    /// returned when no frame has a live owner or the pages stay locked for
    /// `EVICTION_RESCANS` scans. The frame's previous contents are unspecified.
    pub(crate) fn allocate(&self, owner: Owner, swap: &SwapSpace) -> Result<Frame, VmError> {
        for _ in 0..EVICTION_RESCANS {
            let mut table = self.table.lock();
            let frame = match table.free.pop() {
                Some(number) => Frame { number },
                None => match self.evict(&mut table, swap) {
                    Ok(frame) => frame,
                    Err(VmError::OutOfFrames) if has_live_owner(&table.owners) => {
                        drop(table);
                        core::hint::spin_loop();
                        continue;
                    }
                    Err(error) => return Err(error),
                },
            };

            let index = self.index(&frame);
            table.owners[index] = Some(owner);
            return Ok(frame);
        }

        log::warn!("every resident page stayed locked; no frame to evict");
        Err(VmError::OutOfFrames)
    }

    /// Returns `frame` to the pool.
    pub(crate) fn release(&self, frame: Frame) {
        let index = self.index(&frame);
        let mut table = self.table.lock();
        table.owners[index] = None;
        table.free.push(frame.number);
    }

    /// Returns the contents of `frame`.
    pub(crate) fn bytes<'a>(&'a self, frame: &'a Frame) -> &'a [u8] {
        let ptr = self.memory.translate(frame.address());
        // SAFETY: The frame belongs to this pool, so it is mapped by `memory`, and the
        // borrow of the unique `Frame` keeps it from being released or written meanwhile.
        unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) }
    }

    /// Returns the contents of `frame` for writing.
    pub(crate) fn bytes_mut<'a>(&'a self, frame: &'a mut Frame) -> &'a mut [u8] {
        let ptr = self.memory.translate(frame.address());
        // SAFETY: As for `bytes`, and the mutable borrow of the frame makes this the only
        // kernel access to it.
        unsafe { core::slice::from_raw_parts_mut(ptr, PAGE_SIZE) }
    }

    /// Returns the number of frames not owned by any page.
    pub fn free_frames(&self) -> usize {
        self.table.lock().free.len()
    }

    /// Returns the number of frames in the pool.
    pub fn total_frames(&self) -> usize {
        self.count
    }

    fn index(&self, frame: &Frame) -> usize {
        let index = frame.number - self.base;
        assert!(index < self.count, "{frame:?} does not belong to this pool");
        index
    }

    /// Swaps out a victim chosen by the policy and takes its frame.
    ///
    /// Runs with the table locked. Victims are only ever `try_lock`ed, so a page that is
    /// being faulted in, destroyed or copied elsewhere is never chosen.
    fn evict(&self, table: &mut FrameTable, swap: &SwapSpace) -> Result<Frame, VmError> {
        let FrameTable { owners, policy, .. } = table;

        for _ in 0..self.count {
            let index = policy
                .select_victim(&ResidentSet::new(owners))
                .ok_or(VmError::OutOfFrames)?;
            let Some(owner) = &owners[index] else {
                continue;
            };
            let Some(page) = owner.page.upgrade() else {
                continue;
            };
            let Some(mut state) = page.state.try_lock() else {
                continue;
            };

            log::debug!("evicting page {} from frame {}", page.addr(), index);
            let frame = state.swap_out(&page, owner.mmu.as_ref(), self, swap)?;
            drop(state);

            assert_eq!(self.index(&frame), index, "evicted page held another frame");
            owners[index] = None;
            return Ok(frame);
        }

        Err(VmError::OutOfFrames)
    }
}

fn has_live_owner(owners: &[Option<Owner>]) -> bool {
    let resident = ResidentSet::new(owners);
    (0..resident.len()).any(|index| resident.is_resident(index))
}
