//! Page descriptors and the states a page moves through.
//!
//! A page starts out uninitialized: its address is reserved but nothing backs it. The
//! first fault or claim resolves it, exactly once, into an anonymous page (backed by
//! swap) or a file page (backed by its region's file). Resolved pages move between
//! resident and swapped out until they are destroyed.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};

use spin::Mutex;

use crate::{
    FileHandle, Frame, FramePool, MemoryManager, Mmu, PAGE_SIZE, SlotId, SwapSpace,
    VirtualAddress, VmError, frame::Owner, region::Region,
};

/// Fills a freshly allocated frame with the initial contents of a page.
pub trait PageLoader: Send {
    /// Writes the page contents into `page`, which is zeroed beforehand.
    fn load(&mut self, page: &mut [u8]) -> Result<(), VmError>;

    /// Returns an independent copy of this loader for a forked address space.
    fn duplicate(&self) -> Result<Box<dyn PageLoader>, VmError>;
}

/// Loads one page of an executable segment from a shared file handle.
///
/// The bytes after `read_bytes` stay zero. Whoever drops the last reference to the
/// handle closes it, so once the caller lets go of its own reference the last segment
/// loader to be dropped does.
pub struct FileSegment {
    /// Only `None` while the loader is being dropped.
    file: Option<Arc<Mutex<Box<dyn FileHandle>>>>,
    offset: usize,
    read_bytes: usize,
}

impl FileSegment {
    /// Creates a loader reading `read_bytes` bytes at `offset`.
    ///
    /// # Panics
    /// Panics if `read_bytes` exceeds the page size.
    pub fn new(file: Arc<Mutex<Box<dyn FileHandle>>>, offset: usize, read_bytes: usize) -> Self {
        assert!(read_bytes <= PAGE_SIZE, "segment page reads more than a page");
        Self {
            file: Some(file),
            offset,
            read_bytes,
        }
    }

    fn file(&self) -> &Arc<Mutex<Box<dyn FileHandle>>> {
        self.file.as_ref().expect("segment file taken before drop")
    }
}

impl PageLoader for FileSegment {
    fn load(&mut self, page: &mut [u8]) -> Result<(), VmError> {
        self.file()
            .lock()
            .read_exact_at(self.offset, &mut page[..self.read_bytes])?;
        Ok(())
    }

    fn duplicate(&self) -> Result<Box<dyn PageLoader>, VmError> {
        Ok(Box::new(FileSegment::new(
            self.file().clone(),
            self.offset,
            self.read_bytes,
        )))
    }
}

impl Drop for FileSegment {
    fn drop(&mut self) {
        if let Some(file) = self.file.take().and_then(Arc::into_inner) {
            file.into_inner().close();
        }
    }
}

/// The kind of storage that backs a page once it is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Zero-filled memory that is evicted to swap.
    Anon,
    /// Part of a memory-mapped file.
    File,
}

/// Where the contents of a file page live in its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    /// File offset of the first byte of the page.
    pub offset: usize,
    /// Number of bytes read from the file.
    pub read_bytes: usize,
    /// Number of zero bytes filling the rest of the page.
    pub zero_bytes: usize,
}

#[derive(Clone)]
pub(crate) struct FilePage {
    pub(crate) region: Weak<Region>,
    pub(crate) extent: FileExtent,
}

impl FilePage {
    pub(crate) fn region(&self) -> Arc<Region> {
        self.region
            .upgrade()
            .expect("file page outlived its region")
    }

    fn read(&self, page: &mut [u8]) -> Result<(), VmError> {
        let read_bytes = self.extent.read_bytes;
        self.region()
            .read(self.extent.offset, &mut page[..read_bytes])?;
        page[read_bytes..].fill(0);
        Ok(())
    }

    fn write_back(&self, page: &[u8]) -> Result<(), VmError> {
        log::trace!(
            "writing back {} bytes at offset {}",
            self.extent.read_bytes,
            self.extent.offset
        );
        self.region()
            .write(self.extent.offset, &page[..self.extent.read_bytes])?;
        Ok(())
    }
}

pub(crate) enum Pending {
    Anon,
    File(FilePage),
}

pub(crate) struct Uninit {
    pub(crate) pending: Pending,
    pub(crate) loader: Option<Box<dyn PageLoader>>,
}

pub(crate) struct AnonPage {
    pub(crate) slot: Option<SlotId>,
}

pub(crate) enum PageKind {
    Uninit(Uninit),
    Anon(AnonPage),
    File(FilePage),
}

/// Everything about a page that changes, guarded by the page lock.
///
/// A page holds `frame` exactly when it is mapped in its address space's MMU.
pub(crate) struct PageState {
    pub(crate) kind: PageKind,
    pub(crate) frame: Option<Frame>,
}

/// One page of an address space.
pub struct Page {
    addr: VirtualAddress,
    writable: bool,
    stack: bool,
    /// Held for the whole of a resolution, eviction, copy or destruction, so a page is
    /// never resolved twice.
    pub(crate) state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(addr: VirtualAddress, writable: bool, stack: bool, kind: PageKind) -> Self {
        assert!(addr.is_page_aligned(), "page address must be page-aligned");
        Self {
            addr,
            writable,
            stack,
            state: Mutex::new(PageState { kind, frame: None }),
        }
    }

    /// Creates a page that resolves into an anonymous page.
    pub(crate) fn anon(
        addr: VirtualAddress,
        writable: bool,
        stack: bool,
        loader: Option<Box<dyn PageLoader>>,
    ) -> Self {
        let pending = Pending::Anon;
        Self::new(addr, writable, stack, PageKind::Uninit(Uninit { pending, loader }))
    }

    /// Creates a page that resolves into a page of `file`.
    pub(crate) fn file(addr: VirtualAddress, writable: bool, file: FilePage) -> Self {
        let pending = Pending::File(file);
        let loader = None;
        Self::new(addr, writable, false, PageKind::Uninit(Uninit { pending, loader }))
    }

    /// Returns the page-aligned address of the page.
    pub fn addr(&self) -> VirtualAddress {
        self.addr
    }

    /// Returns true if user-mode writes are allowed.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns true if the page was created as a stack page.
    pub fn is_stack(&self) -> bool {
        self.stack
    }

    /// Returns the type the page has, or will have once resolved.
    pub fn page_type(&self) -> PageType {
        match &self.state.lock().kind {
            PageKind::Uninit(Uninit {
                pending: Pending::Anon,
                ..
            })
            | PageKind::Anon(_) => PageType::Anon,
            PageKind::Uninit(Uninit {
                pending: Pending::File(_),
                ..
            })
            | PageKind::File(_) => PageType::File,
        }
    }

    /// Returns true until the page is first resolved.
    pub fn is_uninit(&self) -> bool {
        matches!(self.state.lock().kind, PageKind::Uninit(_))
    }

    /// Returns true if a frame currently backs the page.
    pub fn is_resident(&self) -> bool {
        self.state.lock().frame.is_some()
    }

    /// Returns the swap slot holding the page, if it is swapped out.
    pub fn swap_slot(&self) -> Option<SlotId> {
        match &self.state.lock().kind {
            PageKind::Anon(anon) => anon.slot,
            _ => None,
        }
    }

    /// Returns the file extent of a file page.
    pub fn file_extent(&self) -> Option<FileExtent> {
        match &self.state.lock().kind {
            PageKind::File(file)
            | PageKind::Uninit(Uninit {
                pending: Pending::File(file),
                ..
            }) => Some(file.extent),
            _ => None,
        }
    }

    /// Destroys the page: writes back dirty file contents, unmaps it, and releases its
    /// frame and swap slot.
    ///
    /// Resources are released even if the write-back fails; the error is returned
    /// afterwards.
    pub(crate) fn destroy(&self, mmu: &dyn Mmu, vm: &MemoryManager) -> Result<(), VmError> {
        self.state.lock().destroy(self, mmu, vm)
    }
}

impl PageState {
    pub(crate) fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Makes a non-resident page resident.
    ///
    /// The frame is allocated and mapped first and then filled. On failure the mapping
    /// is removed, the frame released and the page left in its previous state.
    pub(crate) fn claim(
        &mut self,
        page: &Arc<Page>,
        mmu: &Arc<dyn Mmu>,
        vm: &MemoryManager,
    ) -> Result<(), VmError> {
        assert!(!self.is_resident(), "claiming a resident page");

        let frames = vm.frames();
        let mut frame = frames.allocate(Owner::new(page, mmu), vm.swap())?;
        if let Err(error) = mmu.install(page.addr, frame.address(), page.writable) {
            frames.release(frame);
            return Err(error);
        }

        if let Err(error) = self.load(frames.bytes_mut(&mut frame), vm.swap()) {
            log::debug!("loading page {} failed: {error}", page.addr);
            mmu.clear(page.addr);
            frames.release(frame);
            return Err(error);
        }

        self.frame = Some(frame);
        Ok(())
    }

    /// Fills `bytes` with the page contents, resolving an uninitialized page.
    fn load(&mut self, bytes: &mut [u8], swap: &SwapSpace) -> Result<(), VmError> {
        let resolved = match &mut self.kind {
            PageKind::Uninit(uninit) => {
                match (&mut uninit.loader, &uninit.pending) {
                    (Some(loader), _) => {
                        bytes.fill(0);
                        loader.load(bytes)?;
                    }
                    (None, Pending::Anon) => bytes.fill(0),
                    (None, Pending::File(file)) => file.read(bytes)?,
                }
                match &uninit.pending {
                    Pending::Anon => PageKind::Anon(AnonPage { slot: None }),
                    Pending::File(file) => PageKind::File(file.clone()),
                }
            }
            PageKind::Anon(anon) => {
                match anon.slot {
                    Some(slot) => {
                        swap.read(slot, bytes)?;
                        swap.free(slot);
                        anon.slot = None;
                    }
                    None => bytes.fill(0),
                }
                return Ok(());
            }
            PageKind::File(file) => return file.read(bytes),
        };

        self.kind = resolved;
        Ok(())
    }

    /// Evicts a resident page and hands back its frame.
    ///
    /// Anonymous pages go to a fresh swap slot; file pages are written back only if the
    /// MMU marked them dirty. If the I/O fails the mapping is reinstated.
    ///
    /// # Panics
    /// Panics if swap space is exhausted.
    pub(crate) fn swap_out(
        &mut self,
        page: &Page,
        mmu: &dyn Mmu,
        frames: &FramePool,
        swap: &SwapSpace,
    ) -> Result<Frame, VmError> {
        let frame = self.frame.take().expect("evicting a page that is not resident");

        let result = match &mut self.kind {
            PageKind::Anon(anon) => {
                mmu.clear(page.addr);
                let slot = swap
                    .allocate_slot()
                    .unwrap_or_else(|_| panic!("swap space exhausted"));
                match swap.write(slot, frames.bytes(&frame)) {
                    Ok(()) => {
                        anon.slot = Some(slot);
                        Ok(())
                    }
                    Err(error) => {
                        swap.free(slot);
                        Err((error, false))
                    }
                }
            }
            PageKind::File(file) => {
                let dirty = mmu.is_dirty(page.addr);
                mmu.clear(page.addr);
                match dirty {
                    true => file
                        .write_back(frames.bytes(&frame))
                        .map_err(|error| (error, true)),
                    false => Ok(()),
                }
            }
            PageKind::Uninit(_) => panic!("uninitialized page {} is resident", page.addr),
        };

        match result {
            Ok(()) => Ok(frame),
            Err((error, dirty)) => {
                log::warn!("evicting page {} failed: {error}", page.addr);
                mmu.install(page.addr, frame.address(), page.writable)
                    .expect("reinstalling an evicted mapping");
                if dirty {
                    mmu.set_dirty(page.addr, true);
                }
                self.frame = Some(frame);
                Err(error)
            }
        }
    }

    fn destroy(&mut self, page: &Page, mmu: &dyn Mmu, vm: &MemoryManager) -> Result<(), VmError> {
        let mut result = Ok(());

        if let Some(frame) = self.frame.take() {
            if let PageKind::File(file) = &self.kind {
                if mmu.is_dirty(page.addr) {
                    result = file.write_back(vm.frames().bytes(&frame));
                }
            }
            mmu.clear(page.addr);
            vm.frames().release(frame);
        }

        match &mut self.kind {
            PageKind::Anon(anon) => {
                if let Some(slot) = anon.slot.take() {
                    vm.swap().free(slot);
                }
            }
            PageKind::Uninit(uninit) => uninit.loader = None,
            PageKind::File(_) => {}
        }

        result
    }
}
