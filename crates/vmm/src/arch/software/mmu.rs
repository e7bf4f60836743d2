//! An MMU emulated in software.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{entry::PageEntry, flags::PageFlags, table::PageDirectory};
use crate::{Mapping, Mmu, PhysicalAddress, VirtualAddress, VmError};

/// A software MMU with its own emulated page tables.
///
/// The accessed and dirty bits are set by whoever plays the CPU, normally the user-access
/// helpers on [`AddressSpace`](crate::AddressSpace).
pub struct SoftwareMmu {
    directory: Mutex<PageDirectory>,
    activations: AtomicUsize,
}

impl SoftwareMmu {
    /// Creates an MMU with an empty page table.
    pub fn new() -> Self {
        Self {
            directory: Mutex::new(PageDirectory::new()),
            activations: AtomicUsize::new(0),
        }
    }

    /// Returns the number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.directory.lock().present_count()
    }

    /// Returns how many times this page table has been activated.
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::Acquire)
    }

    fn update(&self, page: VirtualAddress, update: impl FnOnce(&mut PageFlags)) {
        let mut directory = self.directory.lock();
        if let Some(entry) = directory.walk(page) {
            if entry.is_present() {
                let mut flags = entry.flags();
                update(&mut flags);
                entry.set_flags(flags);
            }
        }
    }
}

impl Default for SoftwareMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu for SoftwareMmu {
    fn install(
        &self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        writable: bool,
    ) -> Result<(), VmError> {
        assert!(page.is_page_aligned(), "virtual address must be page-aligned");
        assert!(frame.is_page_aligned(), "physical address must be page-aligned");

        let mut directory = self.directory.lock();
        let entry = directory.walk_or_create(page);
        if entry.is_present() {
            return Err(VmError::AlreadyMapped(page));
        }

        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_user(true);
        flags.set_writable(writable);
        *entry = PageEntry::new(frame, flags);
        Ok(())
    }

    fn clear(&self, page: VirtualAddress) {
        if let Some(entry) = self.directory.lock().walk(page) {
            entry.clear();
        }
    }

    fn translate(&self, page: VirtualAddress) -> Option<Mapping> {
        let entry = self.directory.lock().entry(page)?;
        let flags = entry.flags();
        Some(Mapping {
            frame: entry.address()?,
            writable: flags.is_writable(),
            accessed: flags.is_accessed(),
            dirty: flags.is_dirty(),
        })
    }

    fn set_dirty(&self, page: VirtualAddress, dirty: bool) {
        self.update(page, |flags| flags.set_dirty(dirty));
    }

    fn set_accessed(&self, page: VirtualAddress, accessed: bool) {
        self.update(page, |flags| flags.set_accessed(accessed));
    }

    fn activate(&self) {
        self.activations.fetch_add(1, Ordering::AcqRel);
    }
}
