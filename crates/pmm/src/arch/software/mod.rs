//! Software-emulated MMU.
//!
//! The software-emulated architecture is a "scale model" of a 3-level radix MMU:
//! - 19-bit virtual addresses (user space is `[0, MAX_VA)`)
//! - 20-bit physical addresses
//! - 3 levels of page tables, 4-bit indexes (16 entries per table)
//! - 7-bit page offset (128-byte pages)
//!
//! A table holds 16 eight-byte entries, so every page table fits exactly into one frame and
//! is allocated from the same pool as user memory.

mod entry;
mod flags;
mod memory;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use memory::EmulatedMemory;
pub use table::PageTable;

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 20;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = PAGE_SHIFT + PAGE_TABLE_LEVELS * INDEX_BITS;

/// Page size in bytes (128 bytes = 2^7).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of bits in the page offset.
pub const PAGE_SHIFT: usize = 7;

/// Number of page table levels (3 levels: level 2, 1, 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Number of index bits consumed at each level.
pub const INDEX_BITS: usize = 4;

/// Number of entries in one page table.
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;

/// One past the highest user virtual address.
pub const MAX_VA: usize = 1 << MAX_VIRTUAL_BITS;

/// Returns the page table index for a given virtual address at the specified level.
///
/// - Level 0: Bits 7-10 (leaf table)
/// - Level 1: Bits 11-14
/// - Level 2: Bits 15-18 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for software emulation (0-2)"
    );
    let shift = PAGE_SHIFT + level * INDEX_BITS;
    (address >> shift) & (ENTRY_COUNT - 1)
}

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for software emulation.
///
/// The scale model has no upper half; any address up to the `MAX_VA` end boundary is valid.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= MAX_VA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_fills_one_page() {
        assert_eq!(ENTRY_COUNT * core::mem::size_of::<u64>(), PAGE_SIZE);
    }

    #[test]
    fn indexes_split_address() {
        // 0b101_0011_0110_0000101: root 0x5, mid 0x3, leaf 0x6, offset 0x5
        let addr = (0x5 << 15) | (0x3 << 11) | (0x6 << 7) | 0x5;
        assert_eq!(page_index(addr, 2), 0x5);
        assert_eq!(page_index(addr, 1), 0x3);
        assert_eq!(page_index(addr, 0), 0x6);
    }

    #[test]
    #[should_panic(expected = "level out of range")]
    fn rejects_bad_level() {
        page_index(0, 3);
    }

    #[test]
    fn address_limits() {
        assert!(validate_virtual(MAX_VA - 1));
        assert!(validate_virtual(MAX_VA));
        assert!(!validate_virtual(MAX_VA + 1));
        assert!(validate_physical((1 << MAX_PHYSICAL_BITS) - 1));
        assert!(!validate_physical(1 << MAX_PHYSICAL_BITS));
    }
}
