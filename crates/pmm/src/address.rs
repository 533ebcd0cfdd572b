//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, with methods to manipulate them for page table operations.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $validate:path, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            ///
            /// # Panics
            ///
            /// Panics if the address is out of range for the architecture.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!($validate(addr), "address out of range for architecture");
                Self(addr)
            }

            /// Creates a new address, returning `None` if it is out of range.
            #[inline]
            pub const fn try_new(addr: usize) -> Option<Self> {
                if $validate(addr) { Some(Self(addr)) } else { None }
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Returns true if the address sits on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(arch::PAGE_SIZE)
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two or the result is out of range.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self::new((self.0 + align - 1) & !(align - 1))
            }

            /// Adds `bytes`, returning `None` on overflow or if the result is out of range.
            #[inline]
            pub const fn checked_add(self, bytes: usize) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(addr) => Self::try_new(addr),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<$name> for usize {
            #[inline]
            fn from(addr: $name) -> Self {
                addr.0
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    arch::validate_physical,
    "A physical memory address.\n\n\
     Physical addresses index the emulated physical memory owned by the\n\
     [`PhysicalMemoryManager`](crate::PhysicalMemoryManager)."
);

impl PhysicalAddress {
    /// Returns the frame containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::containing(self)
    }
}

impl_address_common!(
    VirtualAddress,
    arch::validate_virtual,
    "A user virtual memory address.\n\n\
     Virtual addresses are only meaningful relative to an\n\
     [`AddressSpace`](crate::AddressSpace); the same value names different memory in\n\
     different processes."
);

impl VirtualAddress {
    /// Returns the offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the page table index at the specified level.
    ///
    /// Page table levels are numbered from 0 (the leaf table) upward.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Gets the corresponding page number for this virtual address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::containing(self)
    }
}
