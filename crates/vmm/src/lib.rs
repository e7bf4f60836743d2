#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager is the demand-paging layer of the Polaris kernel.
//! It gives each process a sparse, lazily populated address space. It provides:
//!
//! - A supplemental page table per address space, recording what belongs where
//!   independently of what is resident.
//! - Pages that start uninitialized and resolve on first touch into anonymous pages
//!   (evicted to swap) or file pages (written back to their file).
//! - A bounded frame pool that recycles frames through a pluggable eviction policy.
//! - Memory-mapped file regions, and an eager fork copier.
//! - Software emulation of the MMU, physical memory, swap disk and files for testing in
//!   non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod disk;
mod error;
mod evict;
mod file;
mod fork;
mod frame;
mod manager;
mod memory;
mod mmu;
mod numbers;
mod page;
mod region;
mod spt;
mod swap;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, DenyWrites, WriteProtect};
pub use disk::{BlockDevice, SECTOR_SIZE, SECTORS_PER_PAGE};
pub use error::{IoError, VmError};
pub use evict::{Clock, EvictionPolicy, ResidentSet};
pub use file::FileHandle;
pub use fork::copy;
pub use frame::{Frame, FramePool};
pub use manager::MemoryManager;
pub use memory::PhysicalMemory;
pub use mmu::{Mapping, Mmu};
pub use numbers::{FrameNumber, PageNumber};
pub use page::{FileExtent, FileSegment, Page, PageLoader, PageType};
pub use region::Region;
pub use spt::SupplementalPageTable;
pub use swap::{SlotId, SwapSpace};

pub use arch::PAGE_SIZE;

#[cfg(target_arch = "x86_64")]
pub use arch::HardwareMmu;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, FileStats, MemoryFile, RamDisk, SoftwareMmu};
