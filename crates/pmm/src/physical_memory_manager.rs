//! Physical frame pool with per-frame reference counts.
//!
//! The manager owns all of (emulated) physical memory and hands it out one frame at a time.
//! Every frame carries a reference count so a single frame can be mapped by several address
//! spaces at once. A frame goes back to the free list when, and only when, its count drops
//! from one to zero in [`PhysicalMemoryManager::release_reference`].

use alloc::boxed::Box;
use core::fmt;

use crate::arch::{EmulatedMemory, PAGE_SIZE};
use crate::{Frame, FrameFlag, FrameNumber, PhysicalAddress};

/// Errors that can occur during physical memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame is available.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

/// Intrusive singly linked list of free frames.
///
/// The link to the next free frame is written into the first word of each free frame, so
/// the list needs no storage of its own. Links are stored as `frame number + 1` so that a
/// zero word terminates the list.
struct FreeList {
    head: Option<FrameNumber>,
    count: usize,
}

impl FreeList {
    /// Creates an empty free list.
    const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    /// Pushes a frame onto the free list.
    fn push(&mut self, memory: &EmulatedMemory, frame: FrameNumber) {
        let link = self.head.map_or(0, |next| next.as_usize() as u64 + 1);
        memory.store_u64(frame.start().as_usize(), link);
        self.head = Some(frame);
        self.count += 1;
    }

    /// Pops a frame from the free list, returning None if empty.
    fn pop(&mut self, memory: &EmulatedMemory) -> Option<FrameNumber> {
        let frame = self.head?;
        let link = memory.load_u64(frame.start().as_usize());
        self.head = link.checked_sub(1).map(|next| FrameNumber::new(next as usize));
        self.count -= 1;
        Some(frame)
    }
}

/// Physical memory manager for single-frame allocations.
///
/// All methods take `&self`: frame metadata is atomic and the free list sits behind a
/// `spin::Mutex`, so the manager can be shared by every core and every process lock holder.
pub struct PhysicalMemoryManager {
    memory: EmulatedMemory,
    frames: Box<[Frame]>,
    free_list: spin::Mutex<FreeList>,
}

impl PhysicalMemoryManager {
    /// Creates a manager for `frame_count` frames of fresh emulated memory, all of them free.
    pub fn new(frame_count: usize) -> Self {
        let memory = EmulatedMemory::new(frame_count * PAGE_SIZE);
        let frames = (0..frame_count).map(|_| Frame::default()).collect();

        let mut free_list = FreeList::new();
        // Push in reverse so allocation hands out ascending addresses.
        for frame in (0..frame_count).rev() {
            free_list.push(&memory, FrameNumber::new(frame));
        }

        log::debug!(
            "physical memory manager: {} frames of {} bytes",
            frame_count,
            PAGE_SIZE
        );

        Self {
            memory,
            frames,
            free_list: spin::Mutex::new(free_list),
        }
    }

    /// Allocates one zeroed frame with a reference count of one.
    pub fn allocate(&self) -> Result<PhysicalAddress, AllocError> {
        let frame_number = self
            .free_list
            .lock()
            .pop(&self.memory)
            .ok_or(AllocError::OutOfMemory)?;

        let addr = frame_number.start();
        self.memory.zero(addr.as_usize(), PAGE_SIZE);

        let frame = self.frame_for(addr);
        frame.init_refcount();
        frame.flags.atomic_set(FrameFlag::Allocated);

        Ok(addr)
    }

    /// Allocates one zeroed frame to hold a page table.
    pub fn allocate_table(&self) -> Result<PhysicalAddress, AllocError> {
        let addr = self.allocate()?;
        self.frame_for(addr).flags.atomic_set(FrameFlag::PageTable);
        Ok(addr)
    }

    /// Adds an owner to the frame at `addr`, returning the new count.
    ///
    /// The caller must already hold a reference to the frame, directly or through a locked
    /// address space that maps it.
    ///
    /// # Panics
    ///
    /// Panics if the frame is free.
    pub fn acquire_reference(&self, addr: PhysicalAddress) -> usize {
        let count = self.frame_for(addr).get();
        log::trace!("frame {} acquired, count {}", addr, count);
        count
    }

    /// Drops an owner of the frame at `addr`, freeing it when the last owner lets go.
    ///
    /// Returns true if the frame went back to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn release_reference(&self, addr: PhysicalAddress) -> bool {
        let frame = self.frame_for(addr);
        if frame.put() > 0 {
            return false;
        }

        frame.flags.atomic_reset();
        self.free_list
            .lock()
            .push(&self.memory, addr.frame_number());
        true
    }

    /// Returns how many owners the frame at `addr` currently has.
    pub fn reference_count(&self, addr: PhysicalAddress) -> usize {
        self.frame_for(addr).refcount()
    }

    /// Returns the metadata for the given frame number.
    pub fn frame(&self, frame_number: FrameNumber) -> Option<&Frame> {
        self.frames.get(frame_number.as_usize())
    }

    /// Returns the total number of frames managed by this allocator.
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of frames on the free list.
    pub fn free_frames(&self) -> usize {
        self.free_list.lock().count
    }

    /// Returns the emulated physical memory backing the frames.
    pub fn memory(&self) -> &EmulatedMemory {
        &self.memory
    }

    fn frame_for(&self, addr: PhysicalAddress) -> &Frame {
        match self.frame(addr.frame_number()) {
            Some(frame) => frame,
            None => panic!("physical address {} outside managed memory", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_every_frame_free() {
        let pmm = PhysicalMemoryManager::new(16);
        assert_eq!(pmm.total_frames(), 16);
        assert_eq!(pmm.free_frames(), 16);
    }

    #[test]
    fn allocates_ascending_zeroed_frames() {
        let pmm = PhysicalMemoryManager::new(4);
        let first = pmm.allocate().unwrap();
        let second = pmm.allocate().unwrap();

        assert_eq!(first, PhysicalAddress::new(0));
        assert_eq!(second, PhysicalAddress::new(PAGE_SIZE));
        assert_eq!(pmm.reference_count(first), 1);
        assert_eq!(pmm.free_frames(), 2);

        // The free-list link written into the frame must not leak out.
        assert_eq!(pmm.memory().load_u64(second.as_usize()), 0);
    }

    #[test]
    fn runs_out_of_memory() {
        let pmm = PhysicalMemoryManager::new(1);
        pmm.allocate().unwrap();
        assert_eq!(pmm.allocate(), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn frees_only_when_last_owner_releases() {
        let pmm = PhysicalMemoryManager::new(2);
        let addr = pmm.allocate().unwrap();

        assert_eq!(pmm.acquire_reference(addr), 2);
        assert!(!pmm.release_reference(addr));
        assert_eq!(pmm.free_frames(), 1);

        assert!(pmm.release_reference(addr));
        assert_eq!(pmm.reference_count(addr), 0);
        assert_eq!(pmm.free_frames(), 2);
        assert!(!pmm.frame(addr.frame_number()).unwrap().flags.atomic_test(FrameFlag::Allocated));
    }

    #[test]
    fn freed_frame_is_reused() {
        let pmm = PhysicalMemoryManager::new(2);
        let addr = pmm.allocate().unwrap();
        pmm.memory().write(addr.as_usize(), b"stale");
        pmm.release_reference(addr);

        let again = pmm.allocate().unwrap();
        assert_eq!(again, addr);
        let mut buf = [0xFFu8; 5];
        pmm.memory().read(again.as_usize(), &mut buf);
        assert_eq!(buf, [0u8; 5]);
    }

    #[test]
    fn table_frames_are_tagged() {
        let pmm = PhysicalMemoryManager::new(1);
        let table = pmm.allocate_table().unwrap();
        let frame = pmm.frame(table.frame_number()).unwrap();
        assert!(frame.flags.atomic_test(FrameFlag::PageTable));

        pmm.release_reference(table);
        assert!(!frame.flags.atomic_test(FrameFlag::PageTable));
    }

    #[test]
    #[should_panic(expected = "frame reference count underflow")]
    fn double_release_is_fatal() {
        let pmm = PhysicalMemoryManager::new(1);
        let addr = pmm.allocate().unwrap();
        pmm.release_reference(addr);
        pmm.release_reference(addr);
    }

    #[test]
    #[should_panic(expected = "outside managed memory")]
    fn rejects_foreign_frames() {
        let pmm = PhysicalMemoryManager::new(1);
        pmm.acquire_reference(PhysicalAddress::new(PAGE_SIZE * 4));
    }

    #[test]
    fn concurrent_references_balance() {
        let pmm = PhysicalMemoryManager::new(1);
        let addr = pmm.allocate().unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        pmm.acquire_reference(addr);
                        pmm.release_reference(addr);
                    }
                });
            }
        });

        assert_eq!(pmm.reference_count(addr), 1);
        assert_eq!(pmm.free_frames(), 0);
    }
}
