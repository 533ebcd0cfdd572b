#![cfg_attr(not(test), no_std)]

//! # Polaris Memory Manager (PMM)
//!
//! The Polaris Memory Manager (PMM) is the memory layer underneath the shared memory
//! kernel. It provides:
//!
//! - A physical frame pool with per-frame reference counts.
//! - Page directories over a software scale model of a 3-level radix MMU.
//! - Per-process address spaces with `sbrk`-style growth, user copies and fork duplication.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod frame;
mod numbers;
mod page_directory;
mod physical_memory_manager;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, VmError, page_round_up};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use numbers::{FrameNumber, PageNumber, pages, pages_for};
pub use page_directory::{MapError, PageDirectory};
pub use physical_memory_manager::{AllocError, PhysicalMemoryManager};

pub use arch::{MAX_VA, PAGE_SIZE, PageFlags};
