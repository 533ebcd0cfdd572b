//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// Flags occupy the low bits of an entry, below the page-aligned frame address. Leaf entries
/// carry the permission bits; intermediate entries only ever set `PRESENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: usize = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: usize = 1 << 2;

    /// No-execute bit (bit 3).
    const NO_EXECUTE: usize = 1 << 3;

    /// Shared bit (bit 4), set on entries that alias another process's frame.
    const SHARED: usize = 1 << 4;

    /// Every bit that has a meaning.
    pub const MASK: usize = 0x1F;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for ordinary user heap memory: present, writable, user, no-execute.
    pub const fn user_data() -> Self {
        Self(Self::PRESENT | Self::WRITABLE | Self::USER | Self::NO_EXECUTE)
    }

    /// Creates page flags from a raw usize value, dropping unknown bits.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw usize value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Returns whether the present bit is set.
    pub const fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.assign(Self::PRESENT, present);
    }

    /// Returns whether the writable bit is set.
    pub const fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.assign(Self::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub const fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.assign(Self::USER, user);
    }

    /// Returns whether the no-execute bit is set.
    pub const fn is_no_execute(self) -> bool {
        (self.0 & Self::NO_EXECUTE) != 0
    }

    /// Sets or clears the no-execute bit.
    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.assign(Self::NO_EXECUTE, no_execute);
    }

    /// Returns whether the shared bit is set.
    pub const fn is_shared(self) -> bool {
        (self.0 & Self::SHARED) != 0
    }

    /// Sets or clears the shared bit.
    pub fn set_shared(&mut self, shared: bool) {
        self.assign(Self::SHARED, shared);
    }

    /// Returns a copy with the shared bit set or cleared.
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.set_shared(shared);
        self
    }

    fn assign(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_permissions() {
        let flags = PageFlags::user_data();
        assert!(flags.is_present());
        assert!(flags.is_writable());
        assert!(flags.is_user());
        assert!(flags.is_no_execute());
        assert!(!flags.is_shared());
    }

    #[test]
    fn toggles_bits() {
        let mut flags = PageFlags::empty();
        flags.set_writable(true);
        flags.set_shared(true);
        assert_eq!(flags.to_raw(), 0b1_0010);

        flags.set_writable(false);
        assert!(!flags.is_writable());
        assert!(flags.is_shared());
    }

    #[test]
    fn from_raw_drops_unknown_bits() {
        assert_eq!(PageFlags::from_raw(0xFF).to_raw(), PageFlags::MASK);
    }
}
