//! Address space management.
//!
//! An [`AddressSpace`] is one process's view of memory: a [`PageDirectory`] plus the size of
//! the heap-style region `[0, size)` that the process has grown with `sbrk`. Shared mappings
//! are installed above the current size and then the size is raised over them, so every
//! mapped page always lies below `size` rounded up to a page.

use core::fmt;

use crate::{
    AllocError, MapError, PageDirectory, PageFlags, PhysicalAddress, PhysicalMemoryManager,
    VirtualAddress,
    arch::{MAX_VA, PAGE_SIZE},
    numbers::pages,
};

/// Errors from address space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Growing would run past the end of the virtual address space.
    AddressSpaceExhausted,
    /// A frame or page table could not be allocated.
    OutOfMemory,
    /// The access touched an unmapped page or a page without the needed permission.
    BadAddress,
}

impl From<AllocError> for VmError {
    fn from(_: AllocError) -> Self {
        VmError::OutOfMemory
    }
}

impl From<MapError> for VmError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => VmError::OutOfMemory,
            // Growth only ever maps above the old size.
            MapError::AlreadyMapped => panic!("address space remapped a live page"),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::AddressSpaceExhausted => write!(f, "out of virtual address space"),
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::BadAddress => write!(f, "bad user address"),
        }
    }
}

/// Rounds a byte size up to a whole number of pages.
#[inline]
pub const fn page_round_up(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// A process's virtual address space.
pub struct AddressSpace {
    directory: PageDirectory,
    /// Highest valid user address boundary; not necessarily page-aligned.
    size: usize,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new(pmm: &PhysicalMemoryManager) -> Result<Self, AllocError> {
        Ok(Self {
            directory: PageDirectory::new(pmm)?,
            size: 0,
        })
    }

    /// Returns the current size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Overrides the recorded size.
    ///
    /// The caller is responsible for the pages between the old and new size: they must be
    /// mapped when growing and already unmapped when shrinking.
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size <= MAX_VA);
        self.size = size;
    }

    /// Returns the first page-aligned address at or above the current size.
    pub fn break_address(&self) -> Option<VirtualAddress> {
        VirtualAddress::try_new(self.size).map(|size| size.align_up(PAGE_SIZE))
    }

    /// Grows the address space by `bytes` of fresh zeroed memory, returning the old size.
    ///
    /// On failure every page allocated by this call is released again and the size is left
    /// unchanged.
    pub fn grow(
        &mut self,
        pmm: &PhysicalMemoryManager,
        bytes: usize,
    ) -> Result<VirtualAddress, VmError> {
        let old = self.size;
        let new = old
            .checked_add(bytes)
            .filter(|&new| new <= MAX_VA)
            .ok_or(VmError::AddressSpaceExhausted)?;

        let first = page_round_up(old);
        let mut mapped = first;
        while mapped < new {
            if let Err(err) = self.grow_page(pmm, VirtualAddress::new(mapped)) {
                self.release_range(pmm, first, mapped);
                log::warn!("grow by {} bytes failed at {:#x}: {}", bytes, mapped, err);
                return Err(err);
            }
            mapped += PAGE_SIZE;
        }

        self.size = new;
        Ok(VirtualAddress::new(old))
    }

    /// Shrinks the address space by `bytes`, releasing the frames that fall off the end.
    pub fn shrink(&mut self, pmm: &PhysicalMemoryManager, bytes: usize) -> Result<(), VmError> {
        let new = self.size.checked_sub(bytes).ok_or(VmError::BadAddress)?;
        self.release_range(pmm, page_round_up(new), page_round_up(self.size));
        self.size = new;
        Ok(())
    }

    /// Returns the frame and permissions mapped at `va`.
    pub fn translate(
        &self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        self.directory.translate(pmm, va)
    }

    /// Installs a single page. Does not change the size or any reference count.
    pub fn map_page(
        &mut self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.directory.map(pmm, va, frame, flags)
    }

    /// Clears a single page, returning the frame it mapped. Does not release the frame.
    pub fn unmap_page(
        &mut self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        self.directory.unmap(pmm, va)
    }

    /// Copies `bytes` from the kernel into user memory at `va`.
    pub fn copy_out(
        &self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < bytes.len() {
            let here = va.checked_add(done).ok_or(VmError::BadAddress)?;
            let phys = self.user_frame(pmm, here, true)?;
            let chunk = (PAGE_SIZE - here.page_offset()).min(bytes.len() - done);
            pmm.memory()
                .write(phys.as_usize() + here.page_offset(), &bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies user memory at `va` into `buf`.
    pub fn copy_in(
        &self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let here = va.checked_add(done).ok_or(VmError::BadAddress)?;
            let phys = self.user_frame(pmm, here, false)?;
            let chunk = (PAGE_SIZE - here.page_offset()).min(buf.len() - done);
            pmm.memory()
                .read(phys.as_usize() + here.page_offset(), &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Creates a private copy of this address space for a forked child.
    ///
    /// Every present private page is copied into a fresh frame with the same permissions.
    /// Shared pages are not inherited; the child sees a hole where the parent has one.
    pub fn duplicate(&self, pmm: &PhysicalMemoryManager) -> Result<AddressSpace, VmError> {
        let mut child = AddressSpace::new(pmm)?;
        child.size = self.size;

        for va in pages(VirtualAddress::new(0), self.size) {
            let Some((frame, flags)) = self.translate(pmm, va) else {
                continue;
            };
            if flags.is_shared() {
                continue;
            }

            if let Err(err) = child.copy_page(pmm, va, frame, flags) {
                child.destroy(pmm);
                return Err(err);
            }
        }

        Ok(child)
    }

    /// Releases every mapped page and frees the page tables.
    ///
    /// Each present page below the size drops exactly one reference; frames still mapped
    /// elsewhere survive.
    pub fn destroy(mut self, pmm: &PhysicalMemoryManager) {
        self.release_range(pmm, 0, page_round_up(self.size));
        self.directory.destroy(pmm);
    }

    fn copy_page(
        &mut self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
        source: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        let copy = pmm.allocate()?;
        pmm.memory().copy(source.as_usize(), copy.as_usize(), PAGE_SIZE);
        if let Err(err) = self.directory.map(pmm, va, copy, flags) {
            pmm.release_reference(copy);
            return Err(err.into());
        }
        Ok(())
    }

    fn grow_page(
        &mut self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
    ) -> Result<(), VmError> {
        let frame = pmm.allocate()?;
        if let Err(err) = self.directory.map(pmm, va, frame, PageFlags::user_data()) {
            pmm.release_reference(frame);
            return Err(err.into());
        }
        Ok(())
    }

    /// Unmaps `[start, end)` and drops one reference per present page; holes are skipped.
    fn release_range(&mut self, pmm: &PhysicalMemoryManager, start: usize, end: usize) {
        for va in (start..end).step_by(PAGE_SIZE) {
            if let Some(frame) = self.directory.unmap(pmm, VirtualAddress::new(va)) {
                pmm.release_reference(frame);
            }
        }
    }

    fn user_frame(
        &self,
        pmm: &PhysicalMemoryManager,
        va: VirtualAddress,
        write: bool,
    ) -> Result<PhysicalAddress, VmError> {
        match self.translate(pmm, va) {
            Some((frame, flags)) if flags.is_user() && (!write || flags.is_writable()) => {
                Ok(frame)
            }
            _ => Err(VmError::BadAddress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(frames: usize) -> (PhysicalMemoryManager, AddressSpace) {
        let pmm = PhysicalMemoryManager::new(frames);
        let space = AddressSpace::new(&pmm).unwrap();
        (pmm, space)
    }

    #[test]
    fn grow_returns_old_break() {
        let (pmm, mut space) = space(32);
        assert_eq!(space.grow(&pmm, 10).unwrap(), VirtualAddress::new(0));
        assert_eq!(space.size(), 10);
        assert_eq!(space.grow(&pmm, PAGE_SIZE).unwrap(), VirtualAddress::new(10));
        assert_eq!(space.size(), 10 + PAGE_SIZE);
        assert_eq!(space.break_address(), Some(VirtualAddress::new(PAGE_SIZE * 2)));

        let (_, flags) = space.translate(&pmm, VirtualAddress::new(PAGE_SIZE)).unwrap();
        assert_eq!(flags, PageFlags::user_data());
    }

    #[test]
    fn grow_past_end_is_exhaustion() {
        let (pmm, mut space) = space(8);
        assert_eq!(
            space.grow(&pmm, MAX_VA + 1),
            Err(VmError::AddressSpaceExhausted)
        );
        assert_eq!(space.size(), 0);
    }

    #[test]
    fn failed_grow_rolls_back() {
        let (pmm, mut space) = space(6);
        // Root + 2 tables + 3 data frames fits; a fourth data page does not.
        let free = pmm.free_frames();
        assert_eq!(
            space.grow(&pmm, PAGE_SIZE * 4),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(space.size(), 0);
        // Only the intermediate tables remain allocated.
        assert_eq!(pmm.free_frames(), free - 2);
        assert!(space.translate(&pmm, VirtualAddress::new(0)).is_none());
    }

    #[test]
    fn shrink_releases_frames() {
        let (pmm, mut space) = space(16);
        space.grow(&pmm, PAGE_SIZE * 3).unwrap();
        let free = pmm.free_frames();

        space.shrink(&pmm, PAGE_SIZE * 2).unwrap();
        assert_eq!(space.size(), PAGE_SIZE);
        assert_eq!(pmm.free_frames(), free + 2);
        assert!(space.translate(&pmm, VirtualAddress::new(PAGE_SIZE)).is_none());
        assert_eq!(space.shrink(&pmm, PAGE_SIZE * 2), Err(VmError::BadAddress));
    }

    #[test]
    fn copy_across_page_boundary() {
        let (pmm, mut space) = space(16);
        space.grow(&pmm, PAGE_SIZE * 2).unwrap();

        let va = VirtualAddress::new(PAGE_SIZE - 4);
        space.copy_out(&pmm, va, b"Hello daddy").unwrap();

        let mut buf = [0u8; 11];
        space.copy_in(&pmm, va, &mut buf).unwrap();
        assert_eq!(&buf, b"Hello daddy");
    }

    #[test]
    fn copy_to_unmapped_page_fails() {
        let (pmm, mut space) = space(16);
        space.grow(&pmm, PAGE_SIZE).unwrap();
        assert_eq!(
            space.copy_out(&pmm, VirtualAddress::new(PAGE_SIZE - 2), b"abcd"),
            Err(VmError::BadAddress)
        );
        let mut buf = [0u8; 1];
        assert_eq!(
            space.copy_in(&pmm, VirtualAddress::new(PAGE_SIZE * 8), &mut buf),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn copy_out_requires_write_permission() {
        let (pmm, mut space) = space(16);
        let frame = pmm.allocate().unwrap();
        let mut read_only = PageFlags::user_data();
        read_only.set_writable(false);
        space.map_page(&pmm, VirtualAddress::new(0), frame, read_only).unwrap();
        space.set_size(PAGE_SIZE);

        assert_eq!(
            space.copy_out(&pmm, VirtualAddress::new(0), b"x"),
            Err(VmError::BadAddress)
        );
        let mut buf = [1u8; 1];
        space.copy_in(&pmm, VirtualAddress::new(0), &mut buf).unwrap();
        assert_eq!(buf, [0]);
    }

    #[test]
    fn duplicate_copies_private_pages_only() {
        let (pmm, mut parent) = space(32);
        parent.grow(&pmm, PAGE_SIZE).unwrap();
        parent.copy_out(&pmm, VirtualAddress::new(0), b"private").unwrap();

        // A shared page borrowed from elsewhere.
        let borrowed = pmm.allocate().unwrap();
        let shared_va = VirtualAddress::new(PAGE_SIZE);
        parent
            .map_page(&pmm, shared_va, borrowed, PageFlags::user_data().with_shared(true))
            .unwrap();
        parent.set_size(PAGE_SIZE * 2);

        let child = parent.duplicate(&pmm).unwrap();
        assert_eq!(child.size(), PAGE_SIZE * 2);
        assert!(child.translate(&pmm, shared_va).is_none());
        assert_eq!(pmm.reference_count(borrowed), 1);

        let (parent_frame, _) = parent.translate(&pmm, VirtualAddress::new(0)).unwrap();
        let (child_frame, _) = child.translate(&pmm, VirtualAddress::new(0)).unwrap();
        assert_ne!(parent_frame, child_frame);

        let mut buf = [0u8; 7];
        child.copy_in(&pmm, VirtualAddress::new(0), &mut buf).unwrap();
        assert_eq!(&buf, b"private");

        child.destroy(&pmm);
    }

    #[test]
    fn destroy_drops_one_reference_per_page() {
        let (pmm, mut space) = space(32);
        let free = pmm.free_frames();
        space.grow(&pmm, PAGE_SIZE * 2).unwrap();

        let (frame, _) = space.translate(&pmm, VirtualAddress::new(0)).unwrap();
        pmm.acquire_reference(frame);

        space.destroy(&pmm);
        assert_eq!(pmm.reference_count(frame), 1);
        // Everything except the extra reference and the root table comes back.
        assert_eq!(pmm.free_frames(), free);
        pmm.release_reference(frame);
    }
}
