//! Page table structure for software emulation.

use alloc::boxed::Box;

use crate::VirtualAddress;

use super::entry::PageEntry;

/// Number of entries in a software-emulated page table.
/// With 10-bit indexes, we have 1024 entries per table.
const ENTRY_COUNT: usize = 1024;

/// A leaf page table for software emulation.
///
/// Address layout:
/// - Bits 0-11: Page offset (4 KiB)
/// - Bits 12-21: Level 0 index (PT)
/// - Bits 22-31: Level 1 index (root)
pub struct PageTable {
    /// The entries in this page table.
    entries: Box<[PageEntry; ENTRY_COUNT]>,
}

impl PageTable {
    /// Creates a new, empty page table.
    ///
    /// All entries are initialized to zero (not present).
    pub fn new() -> Self {
        Self {
            entries: Box::new([PageEntry::default(); ENTRY_COUNT]),
        }
    }

    /// Returns a copy of the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns the number of present entries.
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_present()).count()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The root of an emulated two-level page table hierarchy.
///
/// Leaf tables are allocated lazily when the first page in their 4 MiB span is mapped,
/// like intermediate tables on real hardware.
pub(super) struct PageDirectory {
    tables: Box<[Option<PageTable>]>,
}

impl PageDirectory {
    /// Creates a new page directory with no leaf tables.
    pub fn new() -> Self {
        Self {
            tables: (0..ENTRY_COUNT).map(|_| None).collect(),
        }
    }

    /// Walks the hierarchy to find the entry for a virtual address.
    ///
    /// Returns None if the leaf table does not exist.
    pub fn walk(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        let table = self.tables[virt.page_index(1)].as_mut()?;
        Some(table.entry_mut(virt.page_index(0)))
    }

    /// Walks the hierarchy, creating the leaf table as needed.
    pub fn walk_or_create(&mut self, virt: VirtualAddress) -> &mut PageEntry {
        let table = self.tables[virt.page_index(1)].get_or_insert_with(PageTable::new);
        table.entry_mut(virt.page_index(0))
    }

    /// Returns the entry for a virtual address without creating anything.
    pub fn entry(&self, virt: VirtualAddress) -> Option<PageEntry> {
        let table = self.tables[virt.page_index(1)].as_ref()?;
        Some(table.entry(virt.page_index(0)))
    }

    /// Returns the number of present leaf entries across all tables.
    pub fn present_count(&self) -> usize {
        self.tables
            .iter()
            .flatten()
            .map(PageTable::present_count)
            .sum()
    }
}
