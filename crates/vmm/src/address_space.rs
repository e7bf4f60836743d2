//! Address space management.
//!
//! An address space pairs a supplemental page table, which records what should be
//! mapped, with the MMU that records what currently is. Every operation takes the
//! machine-wide [`MemoryManager`] explicitly; nothing here knows about the current
//! process.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::{Mutex, RwLock};

use crate::{
    MemoryManager, Mmu, SupplementalPageTable, VirtualAddress, VmError,
    page::{Page, PageLoader},
    region::Region,
};

/// Decides what happens when a resident read-only page is written.
pub trait WriteProtect: Send + Sync {
    /// Handles a write fault on `page`.
    fn write_fault(&self, page: &Page, is_user: bool) -> Result<(), VmError>;
}

/// Rejects every write to a read-only page.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyWrites;

impl WriteProtect for DenyWrites {
    fn write_fault(&self, page: &Page, _is_user: bool) -> Result<(), VmError> {
        Err(VmError::ProtectionViolation(page.addr()))
    }
}

/// The virtual address space of one process.
///
/// Lock order is the page table, then a page, then the frame pool, then swap or file
/// I/O. The regions table is only taken while the page table is held.
pub struct AddressSpace {
    pub(crate) mmu: Arc<dyn Mmu>,
    pub(crate) spt: RwLock<SupplementalPageTable>,
    pub(crate) regions: Mutex<BTreeMap<VirtualAddress, Arc<Region>>>,
    pub(crate) write_protect: Arc<dyn WriteProtect>,
}

impl AddressSpace {
    /// Creates an empty address space that denies writes to read-only pages.
    pub fn new(mmu: Arc<dyn Mmu>) -> Self {
        Self::with_write_protect(mmu, Arc::new(DenyWrites))
    }

    /// Creates an empty address space with a custom write-protection policy.
    pub fn with_write_protect(mmu: Arc<dyn Mmu>, write_protect: Arc<dyn WriteProtect>) -> Self {
        Self {
            mmu,
            spt: RwLock::new(SupplementalPageTable::new()),
            regions: Mutex::new(BTreeMap::new()),
            write_protect,
        }
    }

    /// Returns the MMU of this address space.
    pub fn mmu(&self) -> &Arc<dyn Mmu> {
        &self.mmu
    }

    /// Returns the page containing `addr`.
    pub fn lookup(&self, addr: VirtualAddress) -> Option<Arc<Page>> {
        self.spt.read().lookup(addr).cloned()
    }

    /// Returns the number of pages in the address space.
    pub fn page_count(&self) -> usize {
        self.spt.read().len()
    }

    /// Reserves an anonymous page at `addr`.
    ///
    /// Nothing is allocated until the page is first touched. Then `loader`, if given,
    /// fills the zeroed frame.
    pub fn allocate(
        &self,
        addr: VirtualAddress,
        writable: bool,
        loader: Option<Box<dyn PageLoader>>,
    ) -> Result<(), VmError> {
        if !addr.is_page_aligned() {
            return Err(VmError::Misaligned(addr));
        }
        let page = Page::anon(addr, writable, false, loader);
        self.spt.write().insert(Arc::new(page))
    }

    /// Creates a writable stack page at `addr` and makes it resident immediately.
    pub fn allocate_stack(&self, vm: &MemoryManager, addr: VirtualAddress) -> Result<(), VmError> {
        if !addr.is_page_aligned() {
            return Err(VmError::Misaligned(addr));
        }
        self.spt
            .write()
            .insert(Arc::new(Page::anon(addr, true, true, None)))?;

        if let Err(error) = self.claim(vm, addr) {
            // The page is not resident, so removing it cannot fail.
            let _ = self.remove_page(vm, addr);
            return Err(error);
        }
        Ok(())
    }

    /// Handles a page fault at `addr`.
    ///
    /// Returns [`VmError::NotMapped`] if no page covers the address; growing the stack or
    /// killing the process is up to the caller. A write to a resident read-only page is
    /// handed to the write-protection policy. Any other fault on a resident page was
    /// already resolved by a concurrent fault and succeeds.
    pub fn handle_fault(
        &self,
        vm: &MemoryManager,
        addr: VirtualAddress,
        is_write: bool,
        is_user: bool,
    ) -> Result<(), VmError> {
        log::trace!("page fault at {addr} (write: {is_write}, user: {is_user})");

        let spt = self.spt.read();
        let page = spt.lookup(addr).ok_or(VmError::NotMapped(addr))?;
        let mut state = page.state.lock();
        if state.is_resident() {
            drop(state);
            if is_write && !page.is_writable() {
                return self.write_protect.write_fault(page, is_user);
            }
            return Ok(());
        }

        state.claim(page, &self.mmu, vm)
    }

    /// Makes the page containing `addr` resident.
    pub fn claim(&self, vm: &MemoryManager, addr: VirtualAddress) -> Result<(), VmError> {
        let spt = self.spt.read();
        let page = spt.lookup(addr).ok_or(VmError::NotMapped(addr))?;
        let mut state = page.state.lock();
        if state.is_resident() {
            return Ok(());
        }

        log::trace!("claiming page {}", page.addr());
        state.claim(page, &self.mmu, vm)
    }

    /// Removes and destroys the page containing `addr`.
    pub fn remove_page(&self, vm: &MemoryManager, addr: VirtualAddress) -> Result<(), VmError> {
        let page = self
            .spt
            .write()
            .remove(addr)
            .ok_or(VmError::NotMapped(addr))?;
        page.destroy(self.mmu.as_ref(), vm)
    }

    /// Makes this address space the active one on the current CPU.
    pub fn activate(&self) {
        self.mmu.activate();
    }

    /// Destroys the address space.
    ///
    /// Every page is destroyed, writing back dirty file pages and releasing every frame
    /// and swap slot, and every region's file is closed. If a write-back fails, the
    /// remaining resources are still released and the first error is returned.
    pub fn teardown(self, vm: &MemoryManager) -> Result<(), VmError> {
        self.release_all(vm)
    }

    pub(crate) fn release_all(&self, vm: &MemoryManager) -> Result<(), VmError> {
        let pages = self.spt.write().drain();
        log::debug!("tearing down address space with {} pages", pages.len());

        let mut result = Ok(());
        for page in pages {
            if let Err(error) = page.destroy(self.mmu.as_ref(), vm) {
                log::warn!("destroying page {} failed: {error}", page.addr());
                result = result.and(Err(error));
            }
        }

        let regions = core::mem::take(&mut *self.regions.lock());
        for region in regions.into_values() {
            region.close();
        }
        result
    }

    /// Copies `buffer.len()` bytes at `addr` out of the address space as a user-mode
    /// read would, faulting pages in as needed.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn read_user(
        &self,
        vm: &MemoryManager,
        addr: VirtualAddress,
        buffer: &mut [u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < buffer.len() {
            let at = addr + done;
            let count = (crate::PAGE_SIZE - at.page_offset()).min(buffer.len() - done);
            let chunk = &mut buffer[done..done + count];
            self.user_access(vm, at, false, |bytes| chunk.copy_from_slice(&bytes[..count]))?;
            done += count;
        }
        Ok(())
    }

    /// Copies `data` to `addr` as a user-mode write would, faulting pages in as needed.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn write_user(
        &self,
        vm: &MemoryManager,
        addr: VirtualAddress,
        data: &[u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let at = addr + done;
            let count = (crate::PAGE_SIZE - at.page_offset()).min(data.len() - done);
            let chunk = &data[done..done + count];
            self.user_access(vm, at, true, |bytes| bytes[..count].copy_from_slice(chunk))?;
            done += count;
        }
        Ok(())
    }

    /// Performs one access within a page the way the CPU would: if the mapping allows it,
    /// set the accessed and dirty bits and touch the frame, otherwise fault and retry.
    #[cfg(any(test, feature = "software-emulation"))]
    fn user_access(
        &self,
        vm: &MemoryManager,
        addr: VirtualAddress,
        write: bool,
        mut access: impl FnMut(&mut [u8]),
    ) -> Result<(), VmError> {
        let page_addr = addr.page_round_down();

        // A read-only page that is not yet resident may need one fault to bring it in and
        // another to reach the write-protection policy.
        for _ in 0..3 {
            let page = self.lookup(addr).ok_or(VmError::NotMapped(addr))?;
            {
                let mut state = page.state.lock();
                let allowed = self
                    .mmu
                    .translate(page_addr)
                    .is_some_and(|mapping| !write || mapping.writable);
                if let (true, Some(frame)) = (allowed, state.frame.as_mut()) {
                    self.mmu.set_accessed(page_addr, true);
                    if write {
                        self.mmu.set_dirty(page_addr, true);
                    }
                    access(&mut vm.frames().bytes_mut(frame)[addr.page_offset()..]);
                    return Ok(());
                }
            }
            self.handle_fault(vm, addr, write, true)?;
        }

        Err(VmError::ProtectionViolation(addr))
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let pages = self.spt.get_mut().len();
        if pages > 0 {
            log::warn!("address space dropped without teardown; leaking {pages} pages");
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{MemoryFile, PAGE_SIZE, SoftwareMmu};

    const BASE: usize = 0x0040_0000;

    fn at(page: usize) -> VirtualAddress {
        VirtualAddress::new(BASE + page * PAGE_SIZE)
    }

    fn setup(frames: usize) -> (MemoryManager, Arc<SoftwareMmu>, AddressSpace) {
        let vm = MemoryManager::emulated(frames, 16);
        let mmu = Arc::new(SoftwareMmu::new());
        let space = AddressSpace::new(mmu.clone());
        (vm, mmu, space)
    }

    #[test]
    fn fault_on_unknown_address() {
        let (vm, _mmu, space) = setup(1);
        assert_eq!(
            space.handle_fault(&vm, at(3) + 5, false, true),
            Err(VmError::NotMapped(at(3) + 5))
        );
        assert_eq!(space.claim(&vm, at(3)), Err(VmError::NotMapped(at(3))));
    }

    #[test]
    fn fault_installs_mapping_with_page_writability() {
        let (vm, mmu, space) = setup(2);
        space.allocate(at(0), false, None).unwrap();
        space.allocate(at(1), true, None).unwrap();

        space.handle_fault(&vm, at(0), false, true).unwrap();
        space.handle_fault(&vm, at(1) + 100, true, true).unwrap();

        let read_only = mmu.translate(at(0)).unwrap();
        let writable = mmu.translate(at(1)).unwrap();
        assert!(!read_only.writable);
        assert!(writable.writable);
        assert_ne!(read_only.frame, writable.frame);
        assert!(space.lookup(at(1)).unwrap().is_resident());
        space.teardown(&vm).unwrap();
    }

    #[test]
    fn write_to_read_only_page_is_denied() {
        let (vm, _mmu, space) = setup(1);
        space.allocate(at(0), false, None).unwrap();

        assert_eq!(
            space.write_user(&vm, at(0), b"x"),
            Err(VmError::ProtectionViolation(at(0)))
        );
        assert!(space.lookup(at(0)).unwrap().is_resident());
        space.teardown(&vm).unwrap();
    }

    #[test]
    fn custom_write_protect_policy() {
        struct Counting(AtomicUsize);

        impl WriteProtect for Counting {
            fn write_fault(&self, page: &Page, is_user: bool) -> Result<(), VmError> {
                assert!(is_user);
                self.0.fetch_add(1, Ordering::AcqRel);
                Err(VmError::ProtectionViolation(page.addr()))
            }
        }

        let vm = MemoryManager::emulated(1, 1);
        let policy = Arc::new(Counting(AtomicUsize::new(0)));
        let space = AddressSpace::with_write_protect(Arc::new(SoftwareMmu::new()), policy.clone());
        space.allocate(at(0), false, None).unwrap();
        space.claim(&vm, at(0)).unwrap();

        assert!(space.handle_fault(&vm, at(0), true, true).is_err());
        assert_eq!(policy.0.load(Ordering::Acquire), 1);
        space.teardown(&vm).unwrap();
    }

    #[test]
    fn misaligned_allocation_is_rejected() {
        let (vm, _mmu, space) = setup(1);
        assert_eq!(
            space.allocate(at(0) + 1, true, None),
            Err(VmError::Misaligned(at(0) + 1))
        );
        space.allocate(at(0), true, None).unwrap();
        assert_eq!(
            space.allocate(at(0), false, None),
            Err(VmError::AlreadyMapped(at(0)))
        );
        assert_eq!(space.page_count(), 1);
        space.teardown(&vm).unwrap();
    }

    #[test]
    fn stack_page_is_resident_at_once() {
        let (vm, mmu, space) = setup(1);
        space.allocate_stack(&vm, at(7)).unwrap();

        let page = space.lookup(at(7)).unwrap();
        assert!(page.is_stack());
        assert!(page.is_writable());
        assert!(page.is_resident());
        assert!(mmu.translate(at(7)).is_some());
        space.teardown(&vm).unwrap();
    }

    #[test]
    fn failed_stack_allocation_leaves_nothing_behind() {
        let (vm, _mmu, space) = setup(1);
        space.allocate(at(0), true, None).unwrap();
        space.claim(&vm, at(0)).unwrap();

        let held = space.lookup(at(0)).unwrap();
        let guard = held.state.lock();
        assert_eq!(space.allocate_stack(&vm, at(1)), Err(VmError::OutOfFrames));
        drop(guard);
        assert!(space.lookup(at(1)).is_none());
        space.teardown(&vm).unwrap();
    }

    #[test]
    fn activate_forwards_to_mmu() {
        let (_vm, mmu, space) = setup(1);
        space.activate();
        space.activate();
        assert_eq!(mmu.activations(), 2);
    }

    #[test]
    fn concurrent_faults_resolve_once() {
        struct Slow(Arc<AtomicUsize>);

        impl PageLoader for Slow {
            fn load(&mut self, page: &mut [u8]) -> Result<(), VmError> {
                self.0.fetch_add(1, Ordering::AcqRel);
                std::thread::sleep(std::time::Duration::from_millis(5));
                page[0] = 42;
                Ok(())
            }

            fn duplicate(&self) -> Result<Box<dyn PageLoader>, VmError> {
                Ok(Box::new(Slow(self.0.clone())))
            }
        }

        let (vm, mmu, space) = setup(2);
        let loads = Arc::new(AtomicUsize::new(0));
        space
            .allocate(at(0), true, Some(Box::new(Slow(loads.clone()))))
            .unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| space.handle_fault(&vm, at(0), false, true).unwrap());
            }
        });

        assert_eq!(loads.load(Ordering::Acquire), 1);
        assert_eq!(mmu.mapped_pages(), 1);
        let mut byte = [0];
        space.read_user(&vm, at(0), &mut byte).unwrap();
        assert_eq!(byte, [42]);
        space.teardown(&vm).unwrap();
    }

    #[test]
    fn concurrent_faults_under_pressure() {
        let (vm, _mmu, space) = setup(4);
        for page in 0..12 {
            space.allocate(at(page), true, None).unwrap();
        }

        std::thread::scope(|scope| {
            for thread in 0..4 {
                let (space, vm) = (&space, &vm);
                scope.spawn(move || {
                    for round in 0..4 {
                        let page = (thread + round * 3) % 12;
                        let value = [(page + 1) as u8];
                        space.write_user(vm, at(page), &value).unwrap();
                    }
                });
            }
        });

        for page in 0..12 {
            let mut byte = [0];
            space.read_user(&vm, at(page), &mut byte).unwrap();
            assert!(byte[0] == 0 || byte[0] == (page + 1) as u8);
        }
        space.teardown(&vm).unwrap();
        assert_eq!(vm.frames().free_frames(), 4);
        assert_eq!(vm.swap().used_slots(), 0);
    }

    #[test]
    fn faults_wait_for_briefly_locked_victims() {
        let (vm, _mmu, space) = setup(1);
        space.allocate(at(0), true, None).unwrap();
        space.allocate(at(1), true, None).unwrap();

        std::thread::scope(|scope| {
            for page in 0..2 {
                let (space, vm) = (&space, &vm);
                scope.spawn(move || {
                    for round in 0..2_000u32 {
                        let value = round.to_le_bytes();
                        space.write_user(vm, at(page), &value).unwrap();
                        let mut back = [0; 4];
                        space.read_user(vm, at(page), &mut back).unwrap();
                        assert_eq!(back, value);
                    }
                });
            }
        });

        space.teardown(&vm).unwrap();
        assert_eq!(vm.frames().free_frames(), 1);
        assert_eq!(vm.swap().used_slots(), 0);
    }

    #[test]
    fn teardown_releases_everything() {
        let (vm, mmu, space) = setup(2);
        let file = MemoryFile::new(&[9; 3 * PAGE_SIZE]);
        space.map(at(10), 3 * PAGE_SIZE, true, &file, 0).unwrap();
        for page in 0..3 {
            space.allocate(at(page), true, None).unwrap();
            space.write_user(&vm, at(page), b"anon").unwrap();
        }
        space.write_user(&vm, at(11), b"file").unwrap();
        assert!(vm.swap().used_slots() > 0);

        space.teardown(&vm).unwrap();
        assert_eq!(vm.frames().free_frames(), 2);
        assert_eq!(vm.swap().used_slots(), 0);
        assert_eq!(mmu.mapped_pages(), 0);
        assert_eq!(file.stats().open_handles(), 1);
        assert_eq!(&file.contents()[PAGE_SIZE..PAGE_SIZE + 4], b"file");
    }

    #[test]
    fn teardown_reports_write_back_failure_after_releasing() {
        let (vm, _mmu, space) = setup(2);
        let file = MemoryFile::new(&[0; PAGE_SIZE]);
        space.map(at(0), PAGE_SIZE, true, &file, 0).unwrap();
        space.allocate(at(1), true, None).unwrap();
        space.write_user(&vm, at(0), b"lost").unwrap();
        space.write_user(&vm, at(1), b"anon").unwrap();

        file.fail_writes(true);
        assert!(matches!(space.teardown(&vm), Err(VmError::Io(_))));
        assert_eq!(vm.frames().free_frames(), 2);
        assert_eq!(file.stats().open_handles(), 1);
    }
}
