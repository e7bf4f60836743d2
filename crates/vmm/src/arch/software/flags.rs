//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// The bit positions match x86_64 so that the emulated MMU behaves like the real one:
/// the pager sets present/writable/user, and the emulated "hardware" sets accessed and
/// dirty as user accesses go through the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: usize = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: usize = 1 << 2;

    /// Accessed bit (bit 5).
    const ACCESSED: usize = 1 << 5;

    /// Dirty bit (bit 6).
    const DIRTY: usize = 1 << 6;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates page flags from a raw usize value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw usize value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    /// Returns whether the accessed bit is set.
    pub fn is_accessed(self) -> bool {
        (self.0 & Self::ACCESSED) != 0
    }

    /// Sets or clears the accessed bit.
    pub fn set_accessed(&mut self, accessed: bool) {
        self.set(Self::ACCESSED, accessed);
    }

    /// Returns whether the dirty bit is set.
    pub fn is_dirty(self) -> bool {
        (self.0 & Self::DIRTY) != 0
    }

    /// Sets or clears the dirty bit.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.set(Self::DIRTY, dirty);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
