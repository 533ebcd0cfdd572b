//! The kernel context.
//!
//! A [`Kernel`] owns the frame pool, the process directory, and the mapping registry, and
//! exposes the process operations the shared memory subsystem is built into.

use pmm::{PageFlags, PhysicalAddress, PhysicalMemoryManager, VirtualAddress};

use crate::{
    KernelConfig, LockScope, Pid, ProcState, ProcessTable, Reclaimed, Registry, ShmError, engine,
    reclaim,
};

pub struct Kernel {
    config: KernelConfig,
    pmm: PhysicalMemoryManager,
    procs: ProcessTable,
    registry: Registry,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        log::debug!(
            "kernel with {} frames, {} process slots, {} mapping slots",
            config.frames,
            config.max_processes,
            config.max_mappings
        );
        Self {
            config,
            pmm: PhysicalMemoryManager::new(config.frames),
            procs: ProcessTable::new(config.max_processes),
            registry: Registry::new(config.max_mappings),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pmm(&self) -> &PhysicalMemoryManager {
        &self.pmm
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.procs
    }

    /// Starts a lock scope for an operation that needs more than one lock.
    pub fn lock_scope(&self) -> LockScope<'_> {
        LockScope::new(&self.procs, &self.registry)
    }

    /// Number of live mapping records.
    pub fn mapping_count(&self) -> usize {
        self.registry.len()
    }

    pub fn spawn(&self, name: &str) -> Result<Pid, ShmError> {
        self.procs.spawn(&self.pmm, name)
    }

    pub fn fork(&self, parent: Pid) -> Result<Pid, ShmError> {
        self.procs.fork(&self.pmm, parent)
    }

    /// Terminates `pid`: the process stops being live, leaves every mapping it takes part in,
    /// and has its memory torn down. The slot stays a zombie until [`Kernel::reap`].
    pub fn exit(&self, pid: Pid) -> Result<Reclaimed, ShmError> {
        let mut scope = self.lock_scope();
        scope.process(pid)?.set_state(ProcState::Zombie);

        let reclaimed = reclaim(&self.pmm, &mut scope, pid);

        let space = scope.member(pid)?.take_space();
        if let Some(space) = space {
            space.destroy(&self.pmm);
        }
        scope.registry().forget(pid);

        log::debug!("{} exited, {} frames free", pid, self.pmm.free_frames());
        Ok(reclaimed)
    }

    pub fn reap(&self, pid: Pid) -> Result<(), ShmError> {
        self.procs.reap(pid)
    }

    /// Grows or shrinks `pid`'s memory by `delta` bytes, returning the previous size.
    pub fn sbrk(&self, pid: Pid, delta: isize) -> Result<VirtualAddress, ShmError> {
        let mut process = self.procs.find(pid).ok_or(ShmError::NoSuchProcess)?;
        let space = process.space_mut().ok_or(ShmError::NoSuchProcess)?;
        let old = VirtualAddress::new(space.size());
        if delta >= 0 {
            space.grow(&self.pmm, delta.unsigned_abs())?;
        } else {
            space.shrink(&self.pmm, delta.unsigned_abs())?;
        }
        Ok(old)
    }

    /// Maps `[src_va, src_va + size)` of `caller` into `target`.
    pub fn map_shared_pages(
        &self,
        caller: Pid,
        target: Pid,
        src_va: usize,
        size: usize,
    ) -> Result<VirtualAddress, ShmError> {
        engine::establish(&self.pmm, &mut self.lock_scope(), caller, target, src_va, size)
    }

    /// Releases `caller`'s side of the mapping at `va`.
    pub fn unmap_shared_pages(&self, caller: Pid, va: usize, size: usize) -> Result<(), ShmError> {
        engine::release(&self.pmm, &mut self.lock_scope(), caller, va, size)
    }

    /// Copies user memory of `pid` into `buf`.
    pub fn read_user(&self, pid: Pid, va: usize, buf: &mut [u8]) -> Result<(), ShmError> {
        let process = self.procs.find(pid).ok_or(ShmError::NoSuchProcess)?;
        let space = process.space().ok_or(ShmError::NoSuchProcess)?;
        let va = VirtualAddress::try_new(va).ok_or(ShmError::InvalidRange)?;
        Ok(space.copy_in(&self.pmm, va, buf)?)
    }

    /// Copies `bytes` into the user memory of `pid`.
    pub fn write_user(&self, pid: Pid, va: usize, bytes: &[u8]) -> Result<(), ShmError> {
        let process = self.procs.find(pid).ok_or(ShmError::NoSuchProcess)?;
        let space = process.space().ok_or(ShmError::NoSuchProcess)?;
        let va = VirtualAddress::try_new(va).ok_or(ShmError::InvalidRange)?;
        Ok(space.copy_out(&self.pmm, va, bytes)?)
    }

    pub fn process_size(&self, pid: Pid) -> Result<usize, ShmError> {
        let process = self.procs.find(pid).ok_or(ShmError::NoSuchProcess)?;
        Ok(process.size())
    }

    /// Looks up the frame behind `va` in `pid`'s page table.
    pub fn translate(&self, pid: Pid, va: usize) -> Option<(PhysicalAddress, PageFlags)> {
        let process = self.procs.find(pid)?;
        process
            .space()?
            .translate(&self.pmm, VirtualAddress::try_new(va)?)
    }
}
