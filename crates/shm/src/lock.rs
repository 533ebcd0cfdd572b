//! Lock discipline.
//!
//! Every operation that touches more than one lock goes through a [`LockScope`]. Each lock
//! it hands out borrows the scope mutably for as long as the guard lives, so holding two
//! process locks, or a process lock together with the registry lock, does not compile:
//!
//! ```compile_fail
//! # use shm::{Kernel, KernelConfig};
//! let kernel = Kernel::new(KernelConfig::default());
//! let pid = kernel.spawn("init").unwrap();
//! let mut scope = kernel.lock_scope();
//! let process = scope.process(pid).unwrap();
//! let registry = scope.registry();
//! drop(process);
//! ```

use spin::MutexGuard;

use crate::{MappingTable, Pid, Process, ProcessTable, Registry, ShmError};

/// Hands out at most one lock at a time.
pub struct LockScope<'k> {
    procs: &'k ProcessTable,
    registry: &'k Registry,
}

impl<'k> LockScope<'k> {
    pub fn new(procs: &'k ProcessTable, registry: &'k Registry) -> Self {
        Self { procs, registry }
    }

    /// Locks the live process `pid`.
    ///
    /// The directory scan takes each slot lock transiently; only the match stays locked.
    pub fn process(&mut self, pid: Pid) -> Result<MutexGuard<'_, Process>, ShmError> {
        let procs: &ProcessTable = self.procs;
        procs.find(pid).ok_or(ShmError::NoSuchProcess)
    }

    /// Locks `pid` whether it is live or already exiting.
    pub fn member(&mut self, pid: Pid) -> Result<MutexGuard<'_, Process>, ShmError> {
        let procs: &ProcessTable = self.procs;
        procs.find_any(pid).ok_or(ShmError::NoSuchProcess)
    }

    /// Locks the mapping registry.
    pub fn registry(&mut self) -> MutexGuard<'_, MappingTable> {
        let registry: &Registry = self.registry;
        registry.lock()
    }
}
