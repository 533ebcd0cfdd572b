//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::{PAGE_SIZE, flags::PageFlags, validate_physical};

/// A single page table entry for software emulation.
///
/// The entry format:
/// - Bits 0-6: Flags (see [`PageFlags`])
/// - Bits 7-19: Physical frame base address
/// - Bits 20-63: Reserved, always zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Physical address mask (bits 7-19).
    const ADDRESS_MASK: u64 = 0xF_FF80;

    /// Flag bits mask (bits 0-6).
    const FLAGS_MASK: u64 = (PAGE_SIZE - 1) as u64;

    /// An entry with nothing mapped.
    pub const EMPTY: Self = Self(0);

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(PAGE_SIZE),
            "physical address must be page-aligned"
        );
        debug_assert!(validate_physical(address.as_usize()));

        let addr_bits = address.as_usize() as u64 & Self::ADDRESS_MASK;
        let flag_bits = flags.to_raw() as u64 & Self::FLAGS_MASK;
        Self(addr_bits | flag_bits)
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw((self.0 & Self::FLAGS_MASK) as usize)
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns the raw value of this entry.
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Creates an entry from a raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }
}
