//! Conversions between x86_64 page table flags and the pager's view of a mapping.

use ::x86_64::structures::paging::PageTableFlags;

use crate::{Mapping, PhysicalAddress};

/// Builds the flags for a present, user-accessible leaf entry.
pub fn leaf_flags(writable: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    flags.set(PageTableFlags::WRITABLE, writable);
    flags
}

/// Describes an installed leaf entry.
pub fn mapping(frame: PhysicalAddress, flags: PageTableFlags) -> Mapping {
    Mapping {
        frame,
        writable: flags.contains(PageTableFlags::WRITABLE),
        accessed: flags.contains(PageTableFlags::ACCESSED),
        dirty: flags.contains(PageTableFlags::DIRTY),
    }
}
