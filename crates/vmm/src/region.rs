//! Memory-mapped file regions.
//!
//! A region is a run of file pages created by one `map` call. It owns the reopened file
//! handle its pages read from and write back to; the pages only hold a weak reference
//! to it. Unmapping removes every page before the handle is closed, exactly once.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    AddressSpace, FileHandle, IoError, MemoryManager, PAGE_SIZE, PageNumber, VirtualAddress,
    VmError, arch,
    page::{FileExtent, FilePage, Page},
};

/// A contiguous range of file pages sharing one file handle.
pub struct Region {
    base: VirtualAddress,
    length: usize,
    offset: usize,
    writable: bool,
    /// `None` once the region has been unmapped.
    file: Mutex<Option<Box<dyn FileHandle>>>,
}

impl Region {
    fn new(
        base: VirtualAddress,
        length: usize,
        offset: usize,
        writable: bool,
        file: Box<dyn FileHandle>,
    ) -> Self {
        Self {
            base,
            length,
            offset,
            writable,
            file: Mutex::new(Some(file)),
        }
    }

    /// Returns the address of the first page.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the address of the last page.
    pub fn last_page(&self) -> VirtualAddress {
        self.base + (self.page_count() - 1) * PAGE_SIZE
    }

    /// Returns the address just past the last page.
    ///
    /// A region may end at the top of the address space, so this is a plain number.
    pub fn end(&self) -> usize {
        self.base.as_usize() + self.page_count() * PAGE_SIZE
    }

    /// Returns the number of pages in the region.
    pub fn page_count(&self) -> usize {
        PageNumber::count_for(self.length)
    }

    /// Returns the mapped length in bytes, as requested.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns the file offset mapped at the base address.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns true if the pages are writable.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns true if `addr` lies inside the region.
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.base <= addr && addr.page_round_down() <= self.last_page()
    }

    pub(crate) fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<(), IoError> {
        let mut file = self.file.lock();
        file.as_mut()
            .ok_or(IoError::Closed)?
            .read_exact_at(offset, buffer)
    }

    pub(crate) fn write(&self, offset: usize, buffer: &[u8]) -> Result<(), IoError> {
        let mut file = self.file.lock();
        file.as_mut()
            .ok_or(IoError::Closed)?
            .write_exact_at(offset, buffer)
    }

    /// Creates a region over the same file with its own handle.
    pub(crate) fn duplicate(&self) -> Result<Arc<Region>, VmError> {
        let file = self.file.lock();
        let file = file.as_ref().ok_or(IoError::Closed)?.reopen()?;
        Ok(Arc::new(Region::new(
            self.base,
            self.length,
            self.offset,
            self.writable,
            file,
        )))
    }

    /// Closes the file handle. Later calls do nothing.
    pub(crate) fn close(&self) {
        if let Some(file) = self.file.lock().take() {
            file.close();
        }
    }
}

impl AddressSpace {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// The file is reopened, so `file` may be closed as soon as this returns. Pages are
    /// loaded lazily; bytes past the end of the file read as zero. On failure nothing
    /// is left mapped.
    pub fn map(
        &self,
        addr: VirtualAddress,
        length: usize,
        writable: bool,
        file: &dyn FileHandle,
        offset: usize,
    ) -> Result<VirtualAddress, VmError> {
        if addr.is_null() || length == 0 || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if !addr.is_page_aligned() {
            return Err(VmError::Misaligned(addr));
        }
        let file_length = file.length();
        if offset >= file_length {
            return Err(VmError::InvalidArgument);
        }

        let page_count = PageNumber::count_for(length);
        let fits = (page_count - 1)
            .checked_mul(PAGE_SIZE)
            .and_then(|size| addr.as_usize().checked_add(size + PAGE_SIZE - 1))
            .is_some_and(arch::validate_virtual);
        if !fits {
            return Err(VmError::InvalidArgument);
        }

        let mut spt = self.spt.write();
        if spt.overlaps(addr, page_count) {
            return Err(VmError::AlreadyMapped(addr));
        }

        let region = Arc::new(Region::new(addr, length, offset, writable, file.reopen()?));
        let read_total = length.min(file_length - offset);
        let mut inserted = Vec::with_capacity(page_count);

        for index in 0..page_count {
            let start = index * PAGE_SIZE;
            let read_bytes = read_total.saturating_sub(start).min(PAGE_SIZE);
            let page = FilePage {
                region: Arc::downgrade(&region),
                extent: FileExtent {
                    offset: offset + start,
                    read_bytes,
                    zero_bytes: PAGE_SIZE - read_bytes,
                },
            };

            let page_addr = addr + start;
            if let Err(error) = spt.insert(Arc::new(Page::file(page_addr, writable, page))) {
                for page_addr in inserted {
                    spt.remove(page_addr);
                }
                region.close();
                return Err(error);
            }
            inserted.push(page_addr);
        }

        log::debug!("mapped {length} bytes at {addr} ({page_count} pages)");
        self.regions.lock().insert(addr, region);
        Ok(addr)
    }

    /// Unmaps the whole region containing `addr`.
    ///
    /// Every page is removed, in descending address order, writing back dirty pages and
    /// releasing frames; then the region's file is closed. If a write-back fails, the
    /// region is still unmapped and the first error is returned.
    pub fn unmap(&self, vm: &MemoryManager, addr: VirtualAddress) -> Result<(), VmError> {
        if !addr.is_page_aligned() {
            return Err(VmError::Misaligned(addr));
        }

        let mut spt = self.spt.write();
        let region = {
            let mut regions = self.regions.lock();
            let base = regions
                .range(..=addr)
                .next_back()
                .filter(|(_, region)| region.contains(addr))
                .map(|(&base, _)| base)
                .ok_or(VmError::NotMapped(addr))?;
            regions.remove(&base).ok_or(VmError::NotMapped(addr))?
        };

        let mut result = Ok(());
        for index in (0..region.page_count()).rev() {
            let Some(page) = spt.remove(region.base() + index * PAGE_SIZE) else {
                continue;
            };
            let destroyed = page.destroy(self.mmu.as_ref(), vm);
            result = result.and(destroyed);
        }
        drop(spt);

        region.close();
        log::debug!("unmapped region at {}", region.base());
        result
    }

    /// Returns the region containing `addr`.
    pub fn region(&self, addr: VirtualAddress) -> Option<Arc<Region>> {
        self.regions
            .lock()
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
            .cloned()
    }
}
