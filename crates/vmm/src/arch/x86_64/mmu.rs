//! The x86_64 MMU, backed by the CPU's 4-level page tables.

use ::x86_64::{
    PhysAddr, VirtAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{
        FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame,
        Size4KiB, Translate,
        mapper::{MapToError, TranslateResult},
    },
};
use spin::Mutex;

use super::flags;
use crate::{Mapping, Mmu, PhysicalAddress, VirtualAddress, VmError};

struct Tables<A> {
    mapper: OffsetPageTable<'static>,
    /// Supplies frames for intermediate tables.
    allocator: A,
}

/// The page tables of one x86_64 address space.
///
/// Intermediate tables are allocated from `A`, which is separate from the pager's frame
/// pool so that installing a mapping can never recurse into eviction.
pub struct HardwareMmu<A> {
    root: PhysFrame,
    tables: Mutex<Tables<A>>,
}

impl<A> HardwareMmu<A>
where
    A: FrameAllocator<Size4KiB> + Send,
{
    /// Wraps an existing level 4 table.
    ///
    /// # Safety
    /// The caller must ensure:
    /// - `root` is the physical address of a valid level 4 page table
    /// - all physical memory is mapped at `direct_map_offset`
    /// - nothing else mutates the table hierarchy while this value exists
    pub unsafe fn new(root: PhysicalAddress, direct_map_offset: usize, allocator: A) -> Self {
        let root = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
        let offset = VirtAddr::new(direct_map_offset as u64);
        let table: *mut PageTable = (offset + root.start_address().as_u64()).as_mut_ptr();

        // SAFETY: The caller guarantees the table is valid, direct mapped and exclusively ours.
        let mapper = unsafe { OffsetPageTable::new(&mut *table, offset) };

        Self {
            root,
            tables: Mutex::new(Tables { mapper, allocator }),
        }
    }

    fn update(&self, page: VirtualAddress, flag: PageTableFlags, value: bool) {
        let mut tables = self.tables.lock();
        let TranslateResult::Mapped { flags, .. } = tables.mapper.translate(to_virt(page)) else {
            return;
        };

        let mut flags = flags;
        flags.set(flag, value);

        // SAFETY: Only the accessed/dirty bits change; the frame stays mapped.
        if let Ok(flush) = unsafe { tables.mapper.update_flags(to_page(page), flags) } {
            flush.flush();
        }
    }
}

impl<A> Mmu for HardwareMmu<A>
where
    A: FrameAllocator<Size4KiB> + Send,
{
    fn install(
        &self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        writable: bool,
    ) -> Result<(), VmError> {
        let mut tables = self.tables.lock();
        let Tables { mapper, allocator } = &mut *tables;
        let frame = PhysFrame::containing_address(PhysAddr::new(frame.as_usize() as u64));

        // SAFETY: The frame comes from the pager's frame pool and is owned by this page.
        let result = unsafe {
            mapper.map_to(to_page(page), frame, flags::leaf_flags(writable), allocator)
        };
        match result {
            Ok(flush) => {
                flush.flush();
                Ok(())
            }
            Err(MapToError::FrameAllocationFailed) => Err(VmError::OutOfFrames),
            Err(_) => Err(VmError::AlreadyMapped(page)),
        }
    }

    fn clear(&self, page: VirtualAddress) {
        let mut tables = self.tables.lock();
        if let Ok((_, flush)) = tables.mapper.unmap(to_page(page)) {
            flush.flush();
        }
    }

    fn translate(&self, page: VirtualAddress) -> Option<Mapping> {
        let tables = self.tables.lock();
        match tables.mapper.translate(to_virt(page)) {
            TranslateResult::Mapped { frame, flags, .. } => Some(flags::mapping(
                PhysicalAddress::new(frame.start_address().as_u64() as usize),
                flags,
            )),
            _ => None,
        }
    }

    fn set_dirty(&self, page: VirtualAddress, dirty: bool) {
        self.update(page, PageTableFlags::DIRTY, dirty);
    }

    fn set_accessed(&self, page: VirtualAddress, accessed: bool) {
        self.update(page, PageTableFlags::ACCESSED, accessed);
    }

    fn activate(&self) {
        // SAFETY: The kernel half is shared by every address space, so switching tables
        // keeps the running code mapped.
        unsafe {
            Cr3::write(self.root, Cr3Flags::empty());
        }
    }
}

fn to_virt(page: VirtualAddress) -> VirtAddr {
    VirtAddr::new(page.as_usize() as u64)
}

fn to_page(page: VirtualAddress) -> Page<Size4KiB> {
    Page::containing_address(to_virt(page))
}
