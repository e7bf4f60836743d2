//! Emulated physical memory.

use core::alloc::Layout;
use core::ptr::NonNull;

use super::PAGE_SIZE;

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space so that frames handed out by the
/// frame pool have real, host-addressable bytes behind them. Physical address `n` is
/// byte `n` of the buffer.
pub struct EmulatedMemory {
    /// The underlying memory buffer.
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The buffer is a plain heap allocation owned by this value. Callers coordinate
// access to individual frames through frame ownership.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zeroed, page-aligned emulated memory region of the specified size.
    ///
    /// # Panics
    /// Panics if `size` is zero or not a multiple of the page size.
    pub fn new(size: usize) -> Self {
        assert!(
            size > 0 && size % PAGE_SIZE == 0,
            "emulated memory must be a whole number of pages"
        );
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .expect("emulated memory size overflows a layout");

        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout));

        Self { base, layout }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    /// Panics if the address is outside the emulated region.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.layout.size(), "physical address out of bounds");
        // SAFETY: The offset is in bounds of the allocation.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with the same layout.
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}
