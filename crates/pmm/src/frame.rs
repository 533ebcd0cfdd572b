use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Holds metadata for a physical memory frame.
///
/// Modeled after Linux's `struct page`: besides state flags, every frame carries the number
/// of owners currently holding it. A frame mapped by one address space has a count of one;
/// each additional shared mapping adds one.
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    refcount: AtomicUsize,
}

impl Frame {
    /// Returns the current reference count.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Sets the reference count of a frame that was just taken off the free list.
    pub(crate) fn init_refcount(&self) {
        let previous = self.refcount.swap(1, Ordering::AcqRel);
        assert_eq!(previous, 0, "allocated frame still had {previous} owners");
    }

    /// Adds an owner, returning the new count.
    ///
    /// # Panics
    ///
    /// Panics if the frame has no owners, since nobody may legitimately hand out a reference
    /// to a free frame.
    pub(crate) fn get(&self) -> usize {
        let previous = self.refcount.fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0, "reference taken on a free frame");
        previous + 1
    }

    /// Drops an owner, returning the new count.
    ///
    /// # Panics
    ///
    /// Panics on underflow. A count that is already zero means some owner released a
    /// reference it never held; carrying on would hand the frame out twice.
    pub(crate) fn put(&self) -> usize {
        let previous = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
        match previous {
            Ok(previous) => previous - 1,
            Err(_) => panic!("frame reference count underflow"),
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            flags: FrameFlags::new(),
            refcount: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
    /// Frame holds a page table rather than user data.
    PageTable = 1 << 1,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given flag atomically.
    pub fn atomic_set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u64, Ordering::AcqRel);
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        (self.0.load(Ordering::Acquire) & flag as u64) != 0
    }

    /// Clears every flag atomically.
    pub fn atomic_reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}
