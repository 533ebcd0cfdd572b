//! The process directory.
//!
//! Processes live in a fixed table of slots, each behind its own spin lock. Lookup by pid
//! scans the table locking one slot at a time and hands back the matching slot still locked.

use alloc::{boxed::Box, string::String, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use pmm::{AddressSpace, PAGE_SIZE, PhysicalMemoryManager};
use spin::{Mutex, MutexGuard};

use crate::ShmError;

/// A process identifier. Always positive; never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(usize);

impl Pid {
    /// Converts a raw id, rejecting zero.
    pub const fn new(raw: usize) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    /// Exited but not yet reaped.
    Zombie,
}

/// A process control block.
pub struct Process {
    pid: Option<Pid>,
    state: ProcState,
    name: String,
    space: Option<AddressSpace>,
}

impl Process {
    const fn unused() -> Self {
        Self {
            pid: None,
            state: ProcState::Unused,
            name: String::new(),
            space: None,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address space; `None` once the process has been torn down.
    pub fn space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    /// The current size, or zero once torn down.
    pub fn size(&self) -> usize {
        self.space.as_ref().map_or(0, AddressSpace::size)
    }

    pub(crate) fn set_state(&mut self, state: ProcState) {
        self.state = state;
    }

    pub(crate) fn take_space(&mut self) -> Option<AddressSpace> {
        self.space.take()
    }

    fn matches(&self, pid: Pid, live_only: bool) -> bool {
        self.pid == Some(pid)
            && match self.state {
                ProcState::Used => true,
                ProcState::Zombie => !live_only,
                ProcState::Unused => false,
            }
    }
}

/// Fixed-size table of process slots.
pub struct ProcessTable {
    slots: Box<[Mutex<Process>]>,
    next_pid: AtomicUsize,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(Process::unused())).collect(),
            next_pid: AtomicUsize::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Creates a process with a single zeroed page as its initial image.
    pub fn spawn(&self, pmm: &PhysicalMemoryManager, name: &str) -> Result<Pid, ShmError> {
        let mut space = AddressSpace::new(pmm)?;
        if let Err(err) = space.grow(pmm, PAGE_SIZE) {
            space.destroy(pmm);
            return Err(err.into());
        }
        let pid = self.install(pmm, name, space)?;
        log::debug!("spawned {} ({})", pid, name);
        Ok(pid)
    }

    /// Creates a child holding a private copy of `parent`'s memory.
    pub fn fork(&self, pmm: &PhysicalMemoryManager, parent: Pid) -> Result<Pid, ShmError> {
        let (space, name) = {
            let process = self.find(parent).ok_or(ShmError::NoSuchProcess)?;
            let space = process
                .space()
                .ok_or(ShmError::NoSuchProcess)?
                .duplicate(pmm)?;
            (space, process.name.clone())
        };
        let pid = self.install(pmm, &name, space)?;
        log::debug!("forked {} from {}", pid, parent);
        Ok(pid)
    }

    /// Returns the live process with `pid`, locked.
    ///
    /// At most one slot lock is held at any point of the scan.
    pub fn find(&self, pid: Pid) -> Option<MutexGuard<'_, Process>> {
        self.lookup(pid, true)
    }

    /// Like [`ProcessTable::find`], but also returns zombies.
    pub fn find_any(&self, pid: Pid) -> Option<MutexGuard<'_, Process>> {
        self.lookup(pid, false)
    }

    /// Returns a zombie slot to the unused state.
    pub fn reap(&self, pid: Pid) -> Result<(), ShmError> {
        let mut process = self.find_any(pid).ok_or(ShmError::NoSuchProcess)?;
        if process.state != ProcState::Zombie {
            return Err(ShmError::NoSuchProcess);
        }
        debug_assert!(process.space.is_none());
        *process = Process::unused();
        Ok(())
    }

    /// Pids of every process that has not been reaped.
    pub fn pids(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let process = slot.lock();
                match process.state {
                    ProcState::Unused => None,
                    _ => process.pid,
                }
            })
            .collect()
    }

    fn lookup(&self, pid: Pid, live_only: bool) -> Option<MutexGuard<'_, Process>> {
        self.slots
            .iter()
            .map(|slot| slot.lock())
            .find(|process| process.matches(pid, live_only))
    }

    fn install(
        &self,
        pmm: &PhysicalMemoryManager,
        name: &str,
        space: AddressSpace,
    ) -> Result<Pid, ShmError> {
        for slot in self.slots.iter() {
            let mut process = slot.lock();
            if process.state == ProcState::Unused {
                let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
                *process = Process {
                    pid: Some(pid),
                    state: ProcState::Used,
                    name: String::from(name),
                    space: Some(space),
                };
                return Ok(pid);
            }
        }

        log::warn!("process table full, dropping {}", name);
        space.destroy(pmm);
        Err(ShmError::ProcessTableFull)
    }
}
