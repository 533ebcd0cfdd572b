//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which owns a root `PageTable` and provides
//! the single-entry primitives everything else is built from: install, clear, and translate
//! one page, plus freeing the table hierarchy when the address space dies.

use core::fmt;

use crate::{
    AllocError, PhysicalAddress, PhysicalMemoryManager, VirtualAddress,
    arch::{self, EmulatedMemory, PageEntry, PageFlags, PageTable},
};

/// Errors that can occur while installing a page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// An intermediate page table could not be allocated.
    OutOfMemory,
    /// The virtual address already has a present leaf entry.
    AlreadyMapped,
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        MapError::OutOfMemory
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "out of memory for page tables"),
            MapError::AlreadyMapped => write!(f, "virtual address already mapped"),
        }
    }
}

/// An architecture-independent page table manager.
///
/// This type owns the root page table and every intermediate table below it. Tables are
/// frames from the [`PhysicalMemoryManager`], so walking needs the manager to reach emulated
/// memory. Leaf entries point at frames the directory does *not* own; whoever installs a
/// leaf decides what reference it represents.
///
/// A directory must be torn down with [`PageDirectory::destroy`]; dropping it leaks its
/// table frames.
pub struct PageDirectory {
    /// The root page table for this address space.
    root: PageTable,
}

impl PageDirectory {
    /// Creates a new page directory with an empty root page table.
    pub fn new(pmm: &PhysicalMemoryManager) -> Result<Self, AllocError> {
        let root = PageTable::at(pmm.allocate_table()?);
        Ok(Self { root })
    }

    /// Returns the physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root.physical_address()
    }

    /// Maps a virtual page to a physical frame with the given flags.
    ///
    /// Walks the hierarchy, allocating intermediate tables as needed, and installs a present
    /// leaf entry. Tables allocated on the way stay in place if a later step fails.
    ///
    /// # Panics
    /// Panics if either address is not page-aligned.
    pub fn map(
        &mut self,
        pmm: &PhysicalMemoryManager,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        assert!(
            virt.is_page_aligned(),
            "virtual address must be page-aligned"
        );
        assert!(
            phys.is_page_aligned(),
            "physical address must be page-aligned"
        );
        assert!(
            virt.as_usize() < arch::MAX_VA,
            "virtual address beyond the end of the address space"
        );

        let (table, index) = self.walk_or_create(pmm, virt)?;
        let memory = pmm.memory();
        if table.entry(memory, index).is_present() {
            return Err(MapError::AlreadyMapped);
        }

        let mut leaf_flags = flags;
        leaf_flags.set_present(true);
        table.set_entry(memory, index, PageEntry::new(phys, leaf_flags));
        Ok(())
    }

    /// Unmaps a virtual page.
    ///
    /// Clears the leaf entry and returns the frame that was mapped there, or None if nothing
    /// was. The frame's reference is left for the caller to drop.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn unmap(
        &mut self,
        pmm: &PhysicalMemoryManager,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        assert!(
            virt.is_page_aligned(),
            "virtual address must be page-aligned"
        );

        let memory = pmm.memory();
        let (table, index) = self.walk(memory, virt)?;
        let phys = table.entry(memory, index).address()?;
        table.set_entry(memory, index, PageEntry::EMPTY);
        Some(phys)
    }

    /// Looks up the frame and permissions mapped at `virt`.
    ///
    /// `virt` may point anywhere inside the page; the returned address is the frame base.
    pub fn translate(
        &self,
        pmm: &PhysicalMemoryManager,
        virt: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let memory = pmm.memory();
        let (table, index) = self.walk(memory, virt)?;
        let entry = table.entry(memory, index);
        Some((entry.address()?, entry.flags()))
    }

    /// Frees every page table frame in the hierarchy.
    ///
    /// # Panics
    /// Panics if any leaf entry is still present; leaves must be unmapped (and their frames
    /// released) first.
    pub fn destroy(self, pmm: &PhysicalMemoryManager) {
        Self::free_table(pmm, self.root, arch::PAGE_TABLE_LEVELS - 1);
    }

    fn free_table(pmm: &PhysicalMemoryManager, table: PageTable, level: usize) {
        let memory = pmm.memory();
        for index in 0..table.len() {
            let entry = table.entry(memory, index);
            let Some(child) = entry.address() else {
                continue;
            };
            assert!(level > 0, "leaf entry still mapped while freeing page tables");
            Self::free_table(pmm, PageTable::at(child), level - 1);
        }
        pmm.release_reference(table.physical_address());
    }

    /// Walks the page table hierarchy to find the leaf slot for a virtual address.
    ///
    /// Returns None if any intermediate table is not present.
    fn walk(&self, memory: &EmulatedMemory, virt: VirtualAddress) -> Option<(PageTable, usize)> {
        if virt.as_usize() >= arch::MAX_VA {
            return None;
        }

        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry(memory, virt.page_index(level));
            table = PageTable::at(entry.address()?);
        }

        Some((table, virt.page_index(0)))
    }

    /// Walks the page table hierarchy, creating intermediate tables as needed.
    fn walk_or_create(
        &mut self,
        pmm: &PhysicalMemoryManager,
        virt: VirtualAddress,
    ) -> Result<(PageTable, usize), AllocError> {
        let memory = pmm.memory();
        let mut table = self.root;

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let index = virt.page_index(level);
            let entry = table.entry(memory, index);

            let next = match entry.address() {
                Some(next) => next,
                None => {
                    let next = pmm.allocate_table()?;
                    let mut flags = PageFlags::empty();
                    flags.set_present(true);
                    table.set_entry(memory, index, PageEntry::new(next, flags));
                    next
                }
            };
            table = PageTable::at(next);
        }

        Ok((table, virt.page_index(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::PAGE_SIZE;

    #[test]
    fn map_and_translate() {
        let pmm = PhysicalMemoryManager::new(16);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();

        let virt = VirtualAddress::new(PAGE_SIZE * 3);
        dir.map(&pmm, virt, frame, PageFlags::user_data()).unwrap();

        let (phys, flags) = dir.translate(&pmm, virt + 5).unwrap();
        assert_eq!(phys, frame);
        assert!(flags.is_present() && flags.is_user() && flags.is_writable());
        assert!(dir.translate(&pmm, virt + PAGE_SIZE).is_none());
    }

    #[test]
    fn walk_allocates_intermediate_tables_once() {
        let pmm = PhysicalMemoryManager::new(16);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();
        let before = pmm.free_frames();

        dir.map(&pmm, VirtualAddress::new(0), frame, PageFlags::user_data())
            .unwrap();
        // Two intermediate levels below the root.
        assert_eq!(pmm.free_frames(), before - 2);

        dir.map(&pmm, VirtualAddress::new(PAGE_SIZE), frame, PageFlags::user_data())
            .unwrap();
        assert_eq!(pmm.free_frames(), before - 2);
    }

    #[test]
    fn unmap_mapped_page() {
        let pmm = PhysicalMemoryManager::new(16);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();
        let virt = VirtualAddress::new(PAGE_SIZE);

        dir.map(&pmm, virt, frame, PageFlags::user_data()).unwrap();
        assert_eq!(dir.unmap(&pmm, virt), Some(frame));
        assert_eq!(dir.translate(&pmm, virt), None);
        assert_eq!(dir.unmap(&pmm, virt), None);
        // The frame itself is untouched by unmapping.
        assert_eq!(pmm.reference_count(frame), 1);
    }

    #[test]
    fn end_boundary_is_never_mapped() {
        let pmm = PhysicalMemoryManager::new(16);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();
        dir.map(&pmm, VirtualAddress::new(0), frame, PageFlags::user_data())
            .unwrap();

        // MAX_VA would alias index 0 at every level if the walk did not stop it.
        assert_eq!(dir.translate(&pmm, VirtualAddress::new(arch::MAX_VA)), None);
    }

    #[test]
    fn unmap_unmapped_page() {
        let pmm = PhysicalMemoryManager::new(4);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        assert_eq!(dir.unmap(&pmm, VirtualAddress::new(0x4000)), None);
    }

    #[test]
    fn refuses_to_remap() {
        let pmm = PhysicalMemoryManager::new(16);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();
        let virt = VirtualAddress::new(0);

        dir.map(&pmm, virt, frame, PageFlags::user_data()).unwrap();
        assert_eq!(
            dir.map(&pmm, virt, frame, PageFlags::user_data()),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn reports_table_exhaustion() {
        // Root plus the user frame leaves one frame: not enough for two intermediate tables.
        let pmm = PhysicalMemoryManager::new(3);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();

        assert_eq!(
            dir.map(&pmm, VirtualAddress::new(0), frame, PageFlags::user_data()),
            Err(MapError::OutOfMemory)
        );
    }

    #[test]
    fn destroy_returns_every_table() {
        let pmm = PhysicalMemoryManager::new(32);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();
        let far = VirtualAddress::new(arch::MAX_VA - PAGE_SIZE);

        dir.map(&pmm, VirtualAddress::new(0), frame, PageFlags::user_data())
            .unwrap();
        dir.map(&pmm, far, frame, PageFlags::user_data()).unwrap();
        dir.unmap(&pmm, VirtualAddress::new(0));
        dir.unmap(&pmm, far);
        dir.destroy(&pmm);

        assert_eq!(pmm.free_frames(), 31);
    }

    #[test]
    #[should_panic(expected = "leaf entry still mapped")]
    fn destroy_with_live_leaf_is_fatal() {
        let pmm = PhysicalMemoryManager::new(8);
        let mut dir = PageDirectory::new(&pmm).unwrap();
        let frame = pmm.allocate().unwrap();
        dir.map(&pmm, VirtualAddress::new(0), frame, PageFlags::user_data())
            .unwrap();
        dir.destroy(&pmm);
    }
}
