//! The hardware page-table interface consumed by the pager.
//!
//! The pager never asks the MMU which addresses belong to an address space; that is
//! what the supplemental page table is for. It only installs and clears leaf mappings
//! and reads back the accessed and dirty bits the hardware maintains.

use crate::{PhysicalAddress, VirtualAddress, VmError};

/// A snapshot of a single installed leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// The physical frame backing the page.
    pub frame: PhysicalAddress,
    /// Whether user-mode writes are allowed.
    pub writable: bool,
    /// Whether the page has been read or written since the bit was last cleared.
    pub accessed: bool,
    /// Whether the page has been written since it was installed or the bit was last cleared.
    pub dirty: bool,
}

/// Page-table primitives for one address space.
///
/// All addresses passed in are page-aligned. Implementations serialize access
/// internally, so one instance can be shared between the address space and the frame
/// table through an `Arc<dyn Mmu>`.
pub trait Mmu: Send + Sync {
    /// Maps `page` to `frame` as a present, user-accessible page.
    fn install(
        &self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        writable: bool,
    ) -> Result<(), VmError>;

    /// Removes the mapping for `page`, if any.
    fn clear(&self, page: VirtualAddress);

    /// Returns the current mapping for `page`, or `None` if it is not present.
    fn translate(&self, page: VirtualAddress) -> Option<Mapping>;

    /// Sets or clears the dirty bit of an installed mapping.
    fn set_dirty(&self, page: VirtualAddress, dirty: bool);

    /// Sets or clears the accessed bit of an installed mapping.
    fn set_accessed(&self, page: VirtualAddress, accessed: bool);

    /// Makes this page table the active one on the current CPU.
    fn activate(&self);

    /// Returns whether the page has been written through its mapping.
    fn is_dirty(&self, page: VirtualAddress) -> bool {
        self.translate(page).is_some_and(|mapping| mapping.dirty)
    }

    /// Returns whether the page has been touched through its mapping.
    fn is_accessed(&self, page: VirtualAddress) -> bool {
        self.translate(page).is_some_and(|mapping| mapping.accessed)
    }
}
