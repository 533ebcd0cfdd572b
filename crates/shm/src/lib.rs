#![cfg_attr(not(test), no_std)]

//! # Shared memory for Polaris
//!
//! Lets one process map a page range of its own memory into another process's address
//! space, so both see the same physical frames. Frames are reference counted by the
//! [`pmm`] frame pool; a [`Registry`] remembers every mapping so either side can let go of
//! it and so exiting processes are withdrawn from their mappings before their memory is torn
//! down.
//!
//! User space reaches this through two system calls, `map_shared_pages` and
//! `unmap_shared_pages`, dispatched by [`Kernel::syscall`].

extern crate alloc;

mod config;
pub mod engine;
mod error;
mod kernel;
mod lock;
mod proc;
mod reclaim;
mod registry;
pub mod syscall;

pub use config::KernelConfig;
pub use error::ShmError;
pub use kernel::Kernel;
pub use lock::LockScope;
pub use proc::{Pid, ProcState, Process, ProcessTable};
pub use reclaim::{Reclaimed, reclaim};
pub use registry::{
    Attachment, MappingId, MappingTable, Participant, Registry, Release, SharedMapping, Side,
};
pub use syscall::TrapFrame;
