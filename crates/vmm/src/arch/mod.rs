//! Architecture-specific implementations for memory management.
//!
//! This module conditionally imports either hardware-specific implementations
//! or software emulation based on the target architecture and features.

// The x86_64 MMU is compiled on every x86_64 build, including tests, so that it stays
// type-checked. Its constants are only exported when not emulating.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::HardwareMmu;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::{
    MAX_PHYSICAL_BITS, MAX_VIRTUAL_BITS, PAGE_SIZE, page_index, validate_physical,
    validate_virtual,
};

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
