//! Exit-time reclamation of shared mappings.

use pmm::PhysicalMemoryManager;

use crate::{LockScope, Pid, Side, engine};

/// Tallies what [`reclaim`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Destination sides whose entries were cleared.
    pub released: usize,
    /// Source sides marked as no longer backed.
    pub detached: usize,
}

/// Withdraws an exiting process from every mapping it still takes part in.
///
/// Must run after `pid` stops being live and before its address space is torn down.
/// Destination sides are released like an explicit unmap. Source sides are only detached:
/// the process's own teardown drops the references its page table holds, and the references
/// taken on behalf of destinations stay with them.
pub fn reclaim(pmm: &PhysicalMemoryManager, scope: &mut LockScope<'_>, pid: Pid) -> Reclaimed {
    let mut reclaimed = Reclaimed::default();
    let participations = scope.registry().participations(pid);

    for (id, side) in participations {
        match side {
            Side::Destination => {
                let claimed = scope.registry().claim(id, side, pid);
                let Some(release) = claimed else {
                    continue;
                };
                match engine::release_claimed(pmm, scope, pid, release) {
                    Ok(()) => reclaimed.released += 1,
                    Err(err) => log::warn!("reclaim of {:?} for {} failed: {}", id, pid, err),
                }
            }
            Side::Source => {
                if scope.registry().detach_source(id, pid) {
                    reclaimed.detached += 1;
                }
            }
        }
    }

    if reclaimed != Reclaimed::default() {
        log::debug!(
            "reclaimed {} released and {} detached mappings from {}",
            reclaimed.released,
            reclaimed.detached,
            pid
        );
    }
    reclaimed
}
