//! Page and frame number types for memory management.
//!
//! This module provides newtypes for physical frame numbers and virtual page numbers,
//! which are used throughout the memory management subsystem.

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};
use core::{fmt, ops::Add};

/// Macro to define common page/frame number functionality.
///
/// This macro generates the basic structure and methods common to both frame
/// and page number types, reducing code duplication.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses.\n\
     They double as the index into the frame metadata table."
);

impl FrameNumber {
    /// Returns the frame containing `addr`.
    #[inline]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_usize() / arch::PAGE_SIZE)
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Page numbers are zero-indexed and correspond to PAGE_SIZE-aligned virtual addresses."
);

impl PageNumber {
    /// Returns the page containing `addr`.
    #[inline]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(addr.as_usize() / arch::PAGE_SIZE)
    }

    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

/// Returns the number of pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(arch::PAGE_SIZE)
}

/// Iterates the page-aligned addresses of every page in `[start, start + len)`.
///
/// `start` must be page-aligned; a trailing partial page is included.
pub fn pages(start: VirtualAddress, len: usize) -> impl Iterator<Item = VirtualAddress> {
    debug_assert!(start.is_page_aligned());
    (0..pages_for(len)).map(move |i| start + i * arch::PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = FrameNumber::new(42);
        assert_eq!(FrameNumber::containing(frame.start()), frame);
        assert_eq!(frame.start().as_usize(), 42 * arch::PAGE_SIZE);
    }

    #[test]
    fn page_containing_unaligned_address() {
        let addr = VirtualAddress::new(arch::PAGE_SIZE * 5 + 3);
        assert_eq!(PageNumber::containing(addr), PageNumber::new(5));
        assert_eq!(addr.page_number().start(), VirtualAddress::new(arch::PAGE_SIZE * 5));
    }

    #[test]
    fn ordering_and_offsets() {
        assert!(FrameNumber::new(5) < FrameNumber::new(10));
        assert_eq!(PageNumber::new(10) + 5, PageNumber::new(15));
        assert_eq!(format!("{:?}", FrameNumber::new(3)), "FrameNumber(3)");
    }

    #[test]
    fn counts_pages() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(arch::PAGE_SIZE), 1);
        assert_eq!(pages_for(arch::PAGE_SIZE + 1), 2);
    }

    #[test]
    fn iterates_pages() {
        let start = VirtualAddress::new(arch::PAGE_SIZE * 2);
        let all: Vec<_> = pages(start, arch::PAGE_SIZE * 3).collect();
        assert_eq!(
            all,
            [
                VirtualAddress::new(arch::PAGE_SIZE * 2),
                VirtualAddress::new(arch::PAGE_SIZE * 3),
                VirtualAddress::new(arch::PAGE_SIZE * 4),
            ]
        );
    }
}
