//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, with the page rounding helpers the pager uses to key its tables.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns true if the address sits on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(arch::PAGE_SIZE)
            }

            /// Rounds the address down to the start of its page.
            #[inline]
            pub const fn page_round_down(self) -> Self {
                self.align_down(arch::PAGE_SIZE)
            }

            /// Rounds the address up to the next page boundary.
            #[inline]
            pub const fn page_round_up(self) -> Self {
                self.align_up(arch::PAGE_SIZE)
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     physical address. Frames handed out by the frame pool are identified by one."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     virtual address. Page-aligned virtual addresses key the supplemental page table."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "virtual address is not canonical"
        );
        Self(addr)
    }

    /// Returns true for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the page table index at the specified level.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Gets the corresponding page number for this virtual address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(addr.as_usize(), 0x1000);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn frame_number_of_address() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 12);
            assert_eq!(addr.frame_number(), FrameNumber::new(3));
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn page_rounding() {
            let addr = VirtualAddress::new(0x1234_5678);
            assert_eq!(addr.page_round_down(), VirtualAddress::new(0x1234_5000));
            assert_eq!(addr.page_round_up(), VirtualAddress::new(0x1234_6000));
            assert_eq!(addr.page_offset(), 0x678);
            assert!(!addr.is_page_aligned());
            assert!(addr.page_round_down().is_page_aligned());
        }

        #[test]
        fn rounding_an_aligned_address_is_identity() {
            let addr = VirtualAddress::new(arch::PAGE_SIZE * 7);
            assert_eq!(addr.page_round_down(), addr);
            assert_eq!(addr.page_round_up(), addr);
        }

        #[test]
        fn arithmetic() {
            let addr = VirtualAddress::new(0x4000);
            assert_eq!(addr + arch::PAGE_SIZE, VirtualAddress::new(0x5000));
            assert_eq!(addr - arch::PAGE_SIZE, VirtualAddress::new(0x3000));
            assert_eq!(VirtualAddress::new(0x6000) - addr, 0x2000);
        }

        #[test]
        fn null_address() {
            assert!(VirtualAddress::new(0).is_null());
            assert!(!VirtualAddress::new(0x1000).is_null());
        }

        #[test]
        fn formatting() {
            let addr = VirtualAddress::new(0x1000);
            assert_eq!(alloc::format!("{addr}"), "0x1000");
            assert_eq!(alloc::format!("{addr:?}"), "VirtualAddress(0x1000)");
        }
    }
}
