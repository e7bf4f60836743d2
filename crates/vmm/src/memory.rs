//! Kernel access to the contents of physical frames.

use crate::PhysicalAddress;

#[cfg(any(test, feature = "software-emulation"))]
use crate::EmulatedMemory;

/// Translates physical addresses into pointers the kernel can dereference.
///
/// The frame pool owns one of these and uses it to hand out the bytes of the frames it
/// manages.
pub enum PhysicalMemory {
    /// All of physical memory is mapped at a fixed virtual offset.
    DirectMapped { offset: usize },
    /// Physical memory is a host buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl PhysicalMemory {
    /// Creates a translator for a direct map at `offset`.
    ///
    /// # Safety
    /// The caller must ensure every frame later handed to the frame pool is mapped
    /// read-write at `offset + physical address` for as long as this value exists.
    pub const unsafe fn direct_mapped(offset: usize) -> Self {
        Self::DirectMapped { offset }
    }

    /// Creates zeroed emulated memory of `size` bytes.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Returns a pointer to the byte at `phys`.
    pub(crate) fn translate(&self, phys: PhysicalAddress) -> *mut u8 {
        match self {
            PhysicalMemory::DirectMapped { offset } => (offset + phys.as_usize()) as *mut u8,
            #[cfg(any(test, feature = "software-emulation"))]
            PhysicalMemory::Emulated(memory) => memory.translate(phys.as_usize()),
        }
    }
}
