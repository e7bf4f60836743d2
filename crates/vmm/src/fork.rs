//! Duplicating an address space for a child process.
//!
//! Copying is eager: every page that has contents, whether resident or in swap, gets a
//! fresh frame in the child holding a byte-for-byte copy. There is no copy-on-write, so
//! fork costs one frame and one page copy per populated page, and parent and child
//! never share a frame.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::{
    AddressSpace, MemoryManager, Mmu, VirtualAddress, VmError,
    frame::Owner,
    page::{AnonPage, FilePage, Page, PageKind, Pending, Uninit},
    region::Region,
};

type RegionMap = BTreeMap<VirtualAddress, Arc<Region>>;

/// Copies every region and page of `src` into `dst`.
///
/// Child regions reopen their files. Pages keep their address, writability and state:
/// uninitialized pages get a duplicate of their loader, file pages that are not resident
/// are re-read by the child on demand, and pages with contents are copied. A copied
/// file page stays dirty in the child if it was dirty in the parent.
///
/// Copying an address space into itself is rejected with [`VmError::InvalidArgument`].
/// On any other failure `dst` is left partially filled; the caller must tear it down.
pub fn copy(dst: &AddressSpace, src: &AddressSpace, vm: &MemoryManager) -> Result<(), VmError> {
    if core::ptr::eq(dst, src) {
        return Err(VmError::InvalidArgument);
    }

    let src_spt = src.spt.read();
    let mut dst_spt = dst.spt.write();

    let regions = {
        let mut dst_regions = dst.regions.lock();
        for (&base, region) in src.regions.lock().iter() {
            if dst_regions.contains_key(&base) {
                return Err(VmError::AlreadyMapped(base));
            }
            dst_regions.insert(base, region.duplicate()?);
        }
        dst_regions.clone()
    };

    for page in src_spt.iter() {
        if dst_spt.lookup(page.addr()).is_some() {
            return Err(VmError::AlreadyMapped(page.addr()));
        }
        let child = copy_page(page, src.mmu.as_ref(), dst, &regions, vm)?;
        dst_spt.insert(child)?;
    }

    log::debug!("copied {} pages to child address space", dst_spt.len());
    Ok(())
}

fn copy_page(
    page: &Arc<Page>,
    src_mmu: &dyn Mmu,
    dst: &AddressSpace,
    regions: &RegionMap,
    vm: &MemoryManager,
) -> Result<Arc<Page>, VmError> {
    let state = page.state.lock();
    let kind = match &state.kind {
        PageKind::Uninit(uninit) => PageKind::Uninit(Uninit {
            pending: match &uninit.pending {
                Pending::Anon => Pending::Anon,
                Pending::File(file) => Pending::File(remap(file, regions)),
            },
            loader: uninit
                .loader
                .as_ref()
                .map(|loader| loader.duplicate())
                .transpose()?,
        }),
        PageKind::Anon(_) => PageKind::Anon(AnonPage { slot: None }),
        PageKind::File(file) => PageKind::File(remap(file, regions)),
    };
    let child = Arc::new(Page::new(
        page.addr(),
        page.is_writable(),
        page.is_stack(),
        kind,
    ));

    let slot = match &state.kind {
        PageKind::Anon(anon) => anon.slot,
        _ => None,
    };
    if state.frame.is_none() && slot.is_none() {
        return Ok(child);
    }

    let frames = vm.frames();
    let mut child_state = child.state.lock();
    let mut frame = frames.allocate(Owner::new(&child, &dst.mmu), vm.swap())?;
    let filled = match (&state.frame, slot) {
        (Some(parent), _) => {
            frames.bytes_mut(&mut frame).copy_from_slice(frames.bytes(parent));
            Ok(())
        }
        // The parent keeps its slot; the child starts out resident.
        (None, Some(slot)) => vm.swap().read(slot, frames.bytes_mut(&mut frame)),
        (None, None) => unreachable!(),
    };
    let installed =
        filled.and_then(|()| dst.mmu.install(page.addr(), frame.address(), page.is_writable()));
    if let Err(error) = installed {
        frames.release(frame);
        return Err(error);
    }

    if matches!(state.kind, PageKind::File(_)) && src_mmu.is_dirty(page.addr()) {
        dst.mmu.set_dirty(page.addr(), true);
    }
    child_state.frame = Some(frame);
    drop(child_state);
    Ok(child)
}

/// Points a copied file page at the child's copy of its region.
fn remap(file: &FilePage, regions: &RegionMap) -> FilePage {
    let region = regions
        .get(&file.region().base())
        .expect("file page outside every region");
    FilePage {
        region: Arc::downgrade(region),
        extent: file.extent,
    }
}

impl AddressSpace {
    /// Creates a child address space holding a copy of this one.
    ///
    /// The child uses `mmu` and the same write-protection policy. If copying fails, the
    /// partial child is torn down and the error returned. The child is not activated.
    pub fn fork(&self, vm: &MemoryManager, mmu: Arc<dyn Mmu>) -> Result<AddressSpace, VmError> {
        let child = AddressSpace::with_write_protect(mmu, self.write_protect.clone());
        if let Err(error) = copy(&child, self, vm) {
            log::debug!("fork failed: {error}");
            if let Err(teardown) = child.teardown(vm) {
                log::warn!("tearing down partial child failed: {teardown}");
            }
            return Err(error);
        }
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::{MemoryFile, PAGE_SIZE, PageLoader, SoftwareMmu};

    const BASE: usize = 0x1000_0000;

    fn at(page: usize) -> VirtualAddress {
        VirtualAddress::new(BASE + page * PAGE_SIZE)
    }

    fn space() -> (Arc<SoftwareMmu>, AddressSpace) {
        let mmu = Arc::new(SoftwareMmu::new());
        let space = AddressSpace::new(mmu.clone());
        (mmu, space)
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    #[test]
    fn resident_anon_copied_and_file_page_left_lazy() {
        let vm = MemoryManager::emulated(8, 8);
        let (_, parent) = space();
        let file = MemoryFile::new(b"file contents");
        parent.allocate(at(0), true, None).unwrap();
        parent.write_user(&vm, at(0), &pattern(3)).unwrap();
        parent.map(at(4), PAGE_SIZE, false, &file, 0).unwrap();

        let child_mmu = Arc::new(SoftwareMmu::new());
        let child = parent.fork(&vm, child_mmu.clone()).unwrap();

        let copied = child.lookup(at(0)).unwrap();
        assert!(copied.is_resident());
        assert_ne!(
            child_mmu.translate(at(0)).unwrap().frame,
            parent.mmu().translate(at(0)).unwrap().frame
        );
        let lazy = child.lookup(at(4)).unwrap();
        assert!(lazy.is_uninit());
        assert_eq!(lazy.file_extent(), parent.lookup(at(4)).unwrap().file_extent());
        assert_eq!(file.stats().open_handles(), 3);

        parent.write_user(&vm, at(0), b"changed").unwrap();
        let mut contents = vec![0; PAGE_SIZE];
        child.read_user(&vm, at(0), &mut contents).unwrap();
        assert_eq!(contents, pattern(3));

        let mut text = [0; 13];
        child.read_user(&vm, at(4), &mut text).unwrap();
        assert_eq!(&text, b"file contents");

        parent.teardown(&vm).unwrap();
        child.teardown(&vm).unwrap();
        assert_eq!(file.stats().open_handles(), 1);
        assert_eq!(vm.frames().free_frames(), 8);
    }

    #[test]
    fn swapped_anon_page_is_read_into_child() {
        let vm = MemoryManager::emulated(2, 8);
        let (_, parent) = space();
        for page in 0..3 {
            parent.allocate(at(page), true, None).unwrap();
            parent.write_user(&vm, at(page), &pattern(page as u8 + 1)).unwrap();
        }
        assert!(!parent.lookup(at(0)).unwrap().is_resident());

        let child_mmu = Arc::new(SoftwareMmu::new());
        let child = parent.fork(&vm, child_mmu).unwrap();

        let mut contents = vec![0; PAGE_SIZE];
        for page in 0..3 {
            child.read_user(&vm, at(page), &mut contents).unwrap();
            assert_eq!(contents, pattern(page as u8 + 1));
            parent.read_user(&vm, at(page), &mut contents).unwrap();
            assert_eq!(contents, pattern(page as u8 + 1));
        }

        parent.teardown(&vm).unwrap();
        child.teardown(&vm).unwrap();
        assert_eq!(vm.swap().used_slots(), 0);
    }

    #[test]
    fn dirty_file_page_stays_dirty_in_child() {
        let vm = MemoryManager::emulated(4, 4);
        let (_, parent) = space();
        let file = MemoryFile::new(&[0; PAGE_SIZE]);
        parent.map(at(0), PAGE_SIZE, true, &file, 0).unwrap();
        parent.write_user(&vm, at(0), b"unsaved").unwrap();

        let child_mmu = Arc::new(SoftwareMmu::new());
        let child = parent.fork(&vm, child_mmu.clone()).unwrap();
        assert!(child_mmu.is_dirty(at(0)));

        child.teardown(&vm).unwrap();
        assert_eq!(&file.contents()[..7], b"unsaved");
        assert_eq!(file.stats().writes, 1);
        parent.teardown(&vm).unwrap();
        assert_eq!(file.stats().writes, 2);
    }

    #[test]
    fn uninit_loader_is_duplicated() {
        struct Fill(u8);

        impl PageLoader for Fill {
            fn load(&mut self, page: &mut [u8]) -> Result<(), VmError> {
                page.fill(self.0);
                Ok(())
            }

            fn duplicate(&self) -> Result<Box<dyn PageLoader>, VmError> {
                Ok(Box::new(Fill(self.0 + 1)))
            }
        }

        let vm = MemoryManager::emulated(4, 4);
        let (_, parent) = space();
        parent.allocate(at(0), false, Some(Box::new(Fill(1)))).unwrap();

        let child_mmu = Arc::new(SoftwareMmu::new());
        let child = parent.fork(&vm, child_mmu).unwrap();
        assert!(child.lookup(at(0)).unwrap().is_uninit());
        assert!(!child.lookup(at(0)).unwrap().is_writable());

        let mut byte = [0];
        parent.read_user(&vm, at(0), &mut byte).unwrap();
        assert_eq!(byte, [1]);
        child.read_user(&vm, at(0), &mut byte).unwrap();
        assert_eq!(byte, [2]);

        parent.teardown(&vm).unwrap();
        child.teardown(&vm).unwrap();
    }

    #[test]
    fn copy_into_itself_is_rejected() {
        let vm = MemoryManager::emulated(2, 2);
        let (_, parent) = space();
        parent.allocate(at(0), true, None).unwrap();
        parent.write_user(&vm, at(0), b"self").unwrap();

        assert_eq!(copy(&parent, &parent, &vm), Err(VmError::InvalidArgument));
        assert_eq!(parent.page_count(), 1);
        let mut out = [0; 4];
        parent.read_user(&vm, at(0), &mut out).unwrap();
        assert_eq!(&out, b"self");
        parent.teardown(&vm).unwrap();
    }

    #[test]
    fn failed_fork_is_rolled_back() {
        struct Unforkable;

        impl PageLoader for Unforkable {
            fn load(&mut self, _page: &mut [u8]) -> Result<(), VmError> {
                Ok(())
            }

            fn duplicate(&self) -> Result<Box<dyn PageLoader>, VmError> {
                Err(VmError::InvalidArgument)
            }
        }

        let vm = MemoryManager::emulated(4, 4);
        let (_, parent) = space();
        let file = MemoryFile::new(&[1; PAGE_SIZE]);
        parent.map(at(0), PAGE_SIZE, true, &file, 0).unwrap();
        parent.allocate(at(1), true, None).unwrap();
        parent.write_user(&vm, at(1), b"resident").unwrap();
        parent.allocate(at(2), true, Some(Box::new(Unforkable))).unwrap();
        let free = vm.frames().free_frames();

        let child_mmu = Arc::new(SoftwareMmu::new());
        assert_eq!(
            parent.fork(&vm, child_mmu.clone()).err(),
            Some(VmError::InvalidArgument)
        );
        assert_eq!(vm.frames().free_frames(), free);
        assert_eq!(child_mmu.mapped_pages(), 0);
        assert_eq!(file.stats().open_handles(), 2);

        parent.teardown(&vm).unwrap();
    }
}
