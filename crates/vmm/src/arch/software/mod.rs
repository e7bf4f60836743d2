//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated machine that can run on any host.
//! It's designed for testing and development without requiring actual hardware access.
//!
//! The software-emulated MMU is a "scale model" of x86_64:
//! - 32-bit addresses (vs 48-bit on x86_64)
//! - 2 levels of page tables (vs 4 on x86_64)
//! - 10-bit indexes (1024 entries per table, vs 9-bit/512 entries on x86_64)
//! - 12-bit page offset (4 KiB pages, same as x86_64)
//!
//! Alongside the MMU it emulates physical memory, a sector-addressed disk for swap,
//! and in-memory files for memory-mapped regions.

mod disk;
mod entry;
mod file;
mod flags;
mod memory;
mod mmu;
mod table;

pub use disk::RamDisk;
pub use file::{FileStats, MemoryFile};
pub use memory::EmulatedMemory;
pub use mmu::SoftwareMmu;

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB = 2^12).
pub const PAGE_SIZE: usize = 4096;

/// Returns the page table index for a given virtual address at the specified level.
///
/// For software emulation:
/// - Level 0: Bits 12-21 (page table)
/// - Level 1: Bits 22-31 (root/page directory)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    let bits_for_level = match level {
        0 | 1 => 10,
        _ => panic!("level out of range for software emulation (0-1)"),
    };
    let shift = 12 + (level * bits_for_level);
    (address >> shift) & ((1 << bits_for_level) - 1)
}

/// Validates a physical address for software emulation.
///
/// Physical addresses must fit within 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Validates a virtual address for software emulation.
///
/// Virtual addresses must fit within 32 bits.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr >> MAX_VIRTUAL_BITS == 0
}
