//! Page table structure for software emulation.

use crate::PhysicalAddress;

use super::{ENTRY_COUNT, PAGE_SIZE, entry::PageEntry, memory::EmulatedMemory};

/// A view of one page table stored in an emulated physical frame.
///
/// The table itself is just a frame address; entries are read from and written to emulated
/// memory, so a table costs exactly one frame and nothing on the host heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTable {
    frame: PhysicalAddress,
}

impl PageTable {
    /// Wraps the frame at `frame` as a page table.
    ///
    /// The frame must be page-aligned and must have been zeroed before first use.
    pub fn at(frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_aligned(PAGE_SIZE), "page table must be page-aligned");
        Self { frame }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn entry(&self, memory: &EmulatedMemory, index: usize) -> PageEntry {
        PageEntry::from_raw(memory.load_u64(self.slot(index)))
    }

    /// Overwrites the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn set_entry(&self, memory: &EmulatedMemory, index: usize, entry: PageEntry) {
        memory.store_u64(self.slot(index), entry.to_raw());
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Returns the physical address of this page table.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.frame
    }

    fn slot(&self, index: usize) -> usize {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.frame.as_usize() + index * core::mem::size_of::<u64>()
    }
}
