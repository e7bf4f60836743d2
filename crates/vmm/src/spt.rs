//! The supplemental page table.
//!
//! This is the authoritative record of what belongs in an address space. The fault path
//! resolves addresses here and never by walking the hardware page table.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::{PAGE_SIZE, VirtualAddress, VmError, page::Page};

/// Maps page-aligned virtual addresses to the pages of one address space.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtualAddress, Arc<Page>>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Returns the page containing `addr`.
    pub fn lookup(&self, addr: VirtualAddress) -> Option<&Arc<Page>> {
        self.pages.get(&addr.page_round_down())
    }

    /// Adds a page, failing if its address is taken.
    pub fn insert(&mut self, page: Arc<Page>) -> Result<(), VmError> {
        let addr = page.addr();
        if self.pages.contains_key(&addr) {
            return Err(VmError::AlreadyMapped(addr));
        }
        self.pages.insert(addr, page);
        Ok(())
    }

    /// Forgets the page containing `addr` and returns it.
    ///
    /// The page itself is left intact; destroying it is up to the caller.
    pub fn remove(&mut self, addr: VirtualAddress) -> Option<Arc<Page>> {
        self.pages.remove(&addr.page_round_down())
    }

    /// Returns true if any of the `pages` pages starting at `start` is present.
    ///
    /// The run may end at the very top of the address space.
    pub fn overlaps(&self, start: VirtualAddress, pages: usize) -> bool {
        let Some(last) = pages.checked_sub(1) else {
            return false;
        };
        let start = start.page_round_down();
        self.pages
            .range(start..=start + last * PAGE_SIZE)
            .next()
            .is_some()
    }

    /// Returns the number of pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if the table holds no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterates over the pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.pages.values()
    }

    /// Removes every page, returning them in address order.
    pub fn drain(&mut self) -> Vec<Arc<Page>> {
        core::mem::take(&mut self.pages).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(addr: usize) -> Arc<Page> {
        Arc::new(Page::anon(VirtualAddress::new(addr), true, false, None))
    }

    #[test]
    fn lookup_rounds_down() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x4000)).unwrap();

        for addr in [0x4000, 0x4001, 0x4FFF] {
            let found = spt.lookup(VirtualAddress::new(addr)).unwrap();
            assert_eq!(found.addr(), VirtualAddress::new(0x4000));
        }
        assert!(spt.lookup(VirtualAddress::new(0x5000)).is_none());
        assert!(spt.lookup(VirtualAddress::new(0x3FFF)).is_none());
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut spt = SupplementalPageTable::new();
        let first = page(0x4000);
        spt.insert(first.clone()).unwrap();
        assert_eq!(
            spt.insert(page(0x4000)),
            Err(VmError::AlreadyMapped(VirtualAddress::new(0x4000)))
        );
        assert!(Arc::ptr_eq(spt.lookup(VirtualAddress::new(0x4000)).unwrap(), &first));
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn remove_forgets_page() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x4000)).unwrap();
        assert!(spt.remove(VirtualAddress::new(0x4123)).is_some());
        assert!(spt.is_empty());
        assert!(spt.remove(VirtualAddress::new(0x4000)).is_none());
    }

    #[test]
    fn overlap_covers_whole_pages() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x4000)).unwrap();

        let at = |addr: usize| VirtualAddress::new(addr);
        assert!(spt.overlaps(at(0x2000), 3));
        assert!(spt.overlaps(at(0x4000), 1));
        assert!(!spt.overlaps(at(0x2000), 2));
        assert!(!spt.overlaps(at(0x5000), 4));
        assert!(!spt.overlaps(at(0x4000), 0));
    }

    #[test]
    fn drain_returns_pages_in_order() {
        let mut spt = SupplementalPageTable::new();
        for addr in [0x9000, 0x1000, 0x5000] {
            spt.insert(page(addr)).unwrap();
        }
        let drained: Vec<_> = spt.drain().iter().map(|page| page.addr().as_usize()).collect();
        assert_eq!(drained, [0x1000, 0x5000, 0x9000]);
        assert!(spt.is_empty());
    }
}
