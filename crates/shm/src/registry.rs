//! The mapping registry.
//!
//! Every live shared mapping has one record naming both participants. Each participant
//! detaches independently. The destination's entries are what the record exists to tear
//! down, so the record goes away once the destination has detached, unless the source is in
//! the middle of its own release. A claimed side keeps its record, and so its [`MappingId`],
//! alive until the claim is settled. The whole table sits behind a single lock that is only
//! ever held for table bookkeeping, never across a page table walk.

use alloc::vec::Vec;

use pmm::{PhysicalAddress, VirtualAddress};
use spin::{Mutex, MutexGuard};

use crate::{Pid, ShmError};

/// Index of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingId(usize);

/// Which half of a mapping a participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

/// A participant's progress through teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Attached,
    /// A release is clearing this side's page table entries.
    Releasing,
    Detached,
}

/// One process's view of a shared range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub pid: Pid,
    pub base: VirtualAddress,
    pub state: Attachment,
}

impl Participant {
    pub fn attached(pid: Pid, base: VirtualAddress) -> Self {
        Self {
            pid,
            base,
            state: Attachment::Attached,
        }
    }

    fn covers(&self, va: VirtualAddress, length: usize) -> bool {
        va >= self.base && va.as_usize() - self.base.as_usize() < length
    }
}

/// A record of one established sharing relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMapping {
    pub source: Participant,
    pub destination: Participant,
    /// Byte length, a whole number of pages.
    pub length: usize,
    /// Frames in address order.
    pub frames: Vec<PhysicalAddress>,
}

impl SharedMapping {
    pub fn participant(&self, side: Side) -> &Participant {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }

    fn participant_mut(&mut self, side: Side) -> &mut Participant {
        match side {
            Side::Source => &mut self.source,
            Side::Destination => &mut self.destination,
        }
    }

    /// The destination is gone and nobody is still clearing entries under this record.
    fn is_finished(&self) -> bool {
        self.destination.state == Attachment::Detached
            && self.source.state != Attachment::Releasing
    }
}

/// A side claimed for teardown by [`MappingTable::begin_release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub id: MappingId,
    pub side: Side,
    pub base: VirtualAddress,
    pub length: usize,
    pub frames: Vec<PhysicalAddress>,
}

/// A slot claimed before its mapping exists. Participants that exit in the meantime are
/// remembered so the record starts out detached for them.
#[derive(Debug, Clone, Copy)]
struct Pending {
    source: Pid,
    destination: Pid,
    source_gone: bool,
    destination_gone: bool,
}

#[derive(Debug)]
enum Slot {
    Free,
    Reserved(Pending),
    Live(SharedMapping),
}

/// The registry contents, reachable only through the registry lock.
pub struct MappingTable {
    slots: Vec<Slot>,
    live: usize,
}

impl MappingTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Free).collect(),
            live: 0,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, id: MappingId) -> Option<&SharedMapping> {
        match self.slots.get(id.0) {
            Some(Slot::Live(mapping)) => Some(mapping),
            _ => None,
        }
    }

    /// Claims a slot for a mapping that is about to be built.
    pub fn reserve(&mut self, source: Pid, destination: Pid) -> Result<MappingId, ShmError> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .ok_or(ShmError::OutOfMemory)?;
        self.slots[index] = Slot::Reserved(Pending {
            source,
            destination,
            source_gone: false,
            destination_gone: false,
        });
        Ok(MappingId(index))
    }

    /// Fills a reserved slot.
    ///
    /// Returns `false` if the destination exited before the commit, in which case nothing
    /// is recorded.
    pub fn commit(&mut self, id: MappingId, mut mapping: SharedMapping) -> bool {
        let pending = match self.slots.get(id.0) {
            Some(Slot::Reserved(pending)) => *pending,
            other => panic!("commit of mapping slot {:?} in state {:?}", id, other),
        };
        assert_eq!(
            (pending.source, pending.destination),
            (mapping.source.pid, mapping.destination.pid),
            "commit does not match its reservation"
        );

        if pending.source_gone {
            mapping.source.state = Attachment::Detached;
        }
        if pending.destination_gone {
            mapping.destination.state = Attachment::Detached;
        }

        if mapping.is_finished() {
            self.slots[id.0] = Slot::Free;
            return false;
        }
        self.slots[id.0] = Slot::Live(mapping);
        self.live += 1;
        true
    }

    /// Gives back a reserved slot.
    pub fn cancel(&mut self, id: MappingId) {
        assert!(
            matches!(self.slots.get(id.0), Some(Slot::Reserved(_))),
            "cancel of unreserved mapping slot {:?}",
            id
        );
        self.slots[id.0] = Slot::Free;
    }

    /// Records a mapping in one step.
    pub fn insert(&mut self, mapping: SharedMapping) -> Result<MappingId, ShmError> {
        let id = self.reserve(mapping.source.pid, mapping.destination.pid)?;
        self.commit(id, mapping);
        Ok(id)
    }

    /// Finds the mapping whose attached destination side for `pid` contains `va`.
    pub fn find_by_destination(
        &self,
        pid: Pid,
        va: VirtualAddress,
    ) -> Option<(MappingId, &SharedMapping)> {
        self.live()
            .find(|(_, mapping)| Self::holds(mapping, Side::Destination, pid, va))
    }

    /// Finds an attached side of `pid`, on either end, whose range contains `va`.
    pub fn find(&self, pid: Pid, va: VirtualAddress) -> Option<(MappingId, Side)> {
        self.live().find_map(|(id, mapping)| {
            [Side::Destination, Side::Source]
                .into_iter()
                .find(|&side| Self::holds(mapping, side, pid, va))
                .map(|side| (id, side))
        })
    }

    /// Claims the attached side of `pid` based exactly at `va` with exactly `length` bytes.
    pub fn begin_release(
        &mut self,
        pid: Pid,
        va: VirtualAddress,
        length: usize,
    ) -> Result<Release, ShmError> {
        let (id, side) = self
            .live()
            .find_map(|(id, mapping)| {
                if mapping.length != length {
                    return None;
                }
                [Side::Destination, Side::Source]
                    .into_iter()
                    .find(|&side| {
                        let participant = mapping.participant(side);
                        participant.pid == pid
                            && participant.base == va
                            && participant.state == Attachment::Attached
                    })
                    .map(|side| (id, side))
            })
            .ok_or(ShmError::NoSuchMapping)?;

        self.claim(id, side, pid).ok_or(ShmError::NoSuchMapping)
    }

    /// Claims the attached side of `pid` by id.
    pub fn claim(&mut self, id: MappingId, side: Side, pid: Pid) -> Option<Release> {
        let mapping = self.live_mut(id)?;
        let participant = mapping.participant_mut(side);
        if participant.pid != pid || participant.state != Attachment::Attached {
            return None;
        }
        participant.state = Attachment::Releasing;
        let base = participant.base;
        Some(Release {
            id,
            side,
            base,
            length: mapping.length,
            frames: mapping.frames.clone(),
        })
    }

    /// Marks a claimed side detached. Returns `true` if that removed the record.
    pub fn finish_release(&mut self, id: MappingId, side: Side) -> bool {
        self.settle(id, side, Attachment::Detached)
    }

    /// Returns a claimed side to attached after a failed release. Returns `true` if the
    /// record was removed because the other side left in the meantime.
    pub fn abort_release(&mut self, id: MappingId, side: Side) -> bool {
        self.settle(id, side, Attachment::Attached)
    }

    /// Every attached side `pid` takes part in.
    pub fn participations(&self, pid: Pid) -> Vec<(MappingId, Side)> {
        let mut found = Vec::new();
        for (id, mapping) in self.live() {
            for side in [Side::Destination, Side::Source] {
                let participant = mapping.participant(side);
                if participant.pid == pid && participant.state == Attachment::Attached {
                    found.push((id, side));
                }
            }
        }
        found
    }

    /// Marks the attached source side of `pid` detached without touching any page table.
    /// Returns `true` if it was attached.
    pub fn detach_source(&mut self, id: MappingId, pid: Pid) -> bool {
        let Some(mapping) = self.live_mut(id) else {
            return false;
        };
        if mapping.source.pid != pid || mapping.source.state != Attachment::Attached {
            return false;
        }
        mapping.source.state = Attachment::Detached;
        self.collect(id);
        true
    }

    /// Drops every trace of an exited process: its attached sides are detached and its
    /// pending reservations noted. Sides still being released are left to their release.
    /// Returns the number of sides detached.
    pub fn forget(&mut self, pid: Pid) -> usize {
        let mut detached = 0;
        for index in 0..self.slots.len() {
            match &mut self.slots[index] {
                Slot::Free => {}
                Slot::Reserved(pending) => {
                    pending.source_gone |= pending.source == pid;
                    pending.destination_gone |= pending.destination == pid;
                }
                Slot::Live(mapping) => {
                    for side in [Side::Source, Side::Destination] {
                        let participant = mapping.participant_mut(side);
                        if participant.pid == pid && participant.state == Attachment::Attached {
                            participant.state = Attachment::Detached;
                            detached += 1;
                        }
                    }
                    self.collect(MappingId(index));
                }
            }
        }
        detached
    }

    /// Deletes a record regardless of its participants.
    pub fn remove(&mut self, id: MappingId) -> Option<SharedMapping> {
        match self.slots.get(id.0) {
            Some(Slot::Live(_)) => {}
            _ => return None,
        }
        self.live -= 1;
        match core::mem::replace(&mut self.slots[id.0], Slot::Free) {
            Slot::Live(mapping) => Some(mapping),
            _ => None,
        }
    }

    fn live(&self) -> impl Iterator<Item = (MappingId, &SharedMapping)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Live(mapping) => Some((MappingId(index), mapping)),
                _ => None,
            })
    }

    fn live_mut(&mut self, id: MappingId) -> Option<&mut SharedMapping> {
        match self.slots.get_mut(id.0) {
            Some(Slot::Live(mapping)) => Some(mapping),
            _ => None,
        }
    }

    fn settle(&mut self, id: MappingId, side: Side, state: Attachment) -> bool {
        let Some(mapping) = self.live_mut(id) else {
            return false;
        };
        let participant = mapping.participant_mut(side);
        if participant.state == Attachment::Releasing {
            participant.state = state;
        }
        self.collect(id)
    }

    fn holds(mapping: &SharedMapping, side: Side, pid: Pid, va: VirtualAddress) -> bool {
        let participant = mapping.participant(side);
        participant.pid == pid
            && participant.state == Attachment::Attached
            && participant.covers(va, mapping.length)
    }

    /// Frees the slot once the record is finished.
    fn collect(&mut self, id: MappingId) -> bool {
        let detached = self.get(id).is_some_and(SharedMapping::is_finished);
        if detached {
            self.remove(id);
        }
        detached
    }
}

/// The registry lock.
pub struct Registry {
    table: Mutex<MappingTable>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(MappingTable::new(capacity)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MappingTable> {
        self.table.lock()
    }

    /// Number of live records, taking the lock briefly.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
