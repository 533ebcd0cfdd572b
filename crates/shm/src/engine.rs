//! The mapping engine: establishing and releasing shared ranges.
//!
//! Establishing runs as a sequence of short critical sections, each under exactly one lock:
//!
//! 1. registry: reserve a record slot;
//! 2. source: check the range and take a reference on every frame;
//! 3. destination: place the range above its size and install the entries;
//! 4. registry: commit the record.
//!
//! Any failure after step 1 undoes what the earlier steps did before returning, so a failed
//! call leaves no entries, references, or records behind.

use alloc::vec::Vec;

use pmm::{
    MAX_VA, PAGE_SIZE, PageFlags, PhysicalAddress, PhysicalMemoryManager, VirtualAddress, pages,
};

use crate::{LockScope, Participant, Pid, Release, SharedMapping, ShmError};

/// Checks that `(va, size)` describes a non-empty run of whole pages inside user space.
pub fn validate_range(va: usize, size: usize) -> Result<VirtualAddress, ShmError> {
    let va = VirtualAddress::try_new(va).ok_or(ShmError::InvalidRange)?;
    let in_bounds = va
        .as_usize()
        .checked_add(size)
        .is_some_and(|end| end <= MAX_VA);
    if size == 0 || size % PAGE_SIZE != 0 || !va.is_page_aligned() || !in_bounds {
        return Err(ShmError::InvalidRange);
    }
    Ok(va)
}

/// Maps `[src_va, src_va + size)` of `caller` into `target`, returning where it landed.
pub fn establish(
    pmm: &PhysicalMemoryManager,
    scope: &mut LockScope<'_>,
    caller: Pid,
    target: Pid,
    src_va: usize,
    size: usize,
) -> Result<VirtualAddress, ShmError> {
    let src_va = validate_range(src_va, size)?;

    // Refuse a dead target before any frame is touched.
    drop(scope.process(target)?);

    let id = scope.registry().reserve(caller, target)?;
    match build(pmm, scope, caller, target, src_va, size) {
        Ok(mapping) => {
            let base = mapping.destination.base;
            scope.registry().commit(id, mapping);
            log::debug!(
                "shared {:#x} bytes from {} at {} into {} at {}",
                size,
                caller,
                src_va,
                target,
                base
            );
            Ok(base)
        }
        Err(err) => {
            scope.registry().cancel(id);
            log::warn!(
                "map of {} bytes from {} at {} into {} failed: {}",
                size,
                caller,
                src_va,
                target,
                err
            );
            Err(err)
        }
    }
}

fn build(
    pmm: &PhysicalMemoryManager,
    scope: &mut LockScope<'_>,
    caller: Pid,
    target: Pid,
    src_va: VirtualAddress,
    size: usize,
) -> Result<SharedMapping, ShmError> {
    let borrowed = borrow_source(pmm, scope, caller, src_va, size)?;
    match install(pmm, scope, target, &borrowed, size) {
        Ok(base) => Ok(SharedMapping {
            source: Participant::attached(caller, src_va),
            destination: Participant::attached(target, base),
            length: size,
            frames: borrowed.into_iter().map(|(frame, _)| frame).collect(),
        }),
        Err(err) => {
            for &(frame, _) in &borrowed {
                pmm.release_reference(frame);
            }
            Err(err)
        }
    }
}

/// Takes a reference on every frame of the source range while the source is locked.
fn borrow_source(
    pmm: &PhysicalMemoryManager,
    scope: &mut LockScope<'_>,
    caller: Pid,
    src_va: VirtualAddress,
    size: usize,
) -> Result<Vec<(PhysicalAddress, PageFlags)>, ShmError> {
    let process = scope.process(caller)?;
    let space = process.space().ok_or(ShmError::NoSuchProcess)?;
    if src_va.as_usize() + size > space.size() {
        return Err(ShmError::InvalidRange);
    }

    let mut borrowed = Vec::with_capacity(size / PAGE_SIZE);
    for va in pages(src_va, size) {
        match space.translate(pmm, va) {
            Some((frame, flags)) if flags.is_user() => {
                pmm.acquire_reference(frame);
                borrowed.push((frame, flags));
            }
            _ => {
                for &(frame, _) in &borrowed {
                    pmm.release_reference(frame);
                }
                return Err(ShmError::InvalidRange);
            }
        }
    }
    Ok(borrowed)
}

/// Installs the borrowed frames at the first page boundary above the target's size and grows
/// the size over them.
fn install(
    pmm: &PhysicalMemoryManager,
    scope: &mut LockScope<'_>,
    target: Pid,
    borrowed: &[(PhysicalAddress, PageFlags)],
    size: usize,
) -> Result<VirtualAddress, ShmError> {
    let mut process = scope.process(target)?;
    let space = process.space_mut().ok_or(ShmError::NoSuchProcess)?;

    let base = space
        .break_address()
        .filter(|base| base.as_usize() + size <= MAX_VA)
        .ok_or(ShmError::AddressSpaceExhausted)?;

    for (index, &(frame, flags)) in borrowed.iter().enumerate() {
        let va = base + index * PAGE_SIZE;
        if let Err(err) = space.map_page(pmm, va, frame, flags.with_shared(true)) {
            for undo in pages(base, index * PAGE_SIZE) {
                space.unmap_page(pmm, undo);
            }
            return Err(err.into());
        }
        log::trace!("{}: {} -> {}", target, va, frame);
    }

    space.set_size(base.as_usize() + size);
    Ok(base)
}

/// Releases the caller's own side of the mapping based at `va` with length `size`.
pub fn release(
    pmm: &PhysicalMemoryManager,
    scope: &mut LockScope<'_>,
    caller: Pid,
    va: usize,
    size: usize,
) -> Result<(), ShmError> {
    let va = validate_range(va, size)?;
    let claimed = scope.registry().begin_release(caller, va, size);
    match claimed {
        Ok(release) => release_claimed(pmm, scope, caller, release),
        Err(err) => {
            log::warn!("unmap of {} bytes at {} by {} failed: {}", size, va, caller, err);
            Err(err)
        }
    }
}

/// Clears a claimed side from `pid`'s page table and settles the registry record.
pub(crate) fn release_claimed(
    pmm: &PhysicalMemoryManager,
    scope: &mut LockScope<'_>,
    pid: Pid,
    release: Release,
) -> Result<(), ShmError> {
    match clear(pmm, scope, pid, &release) {
        Ok(cleared) => {
            let removed = scope.registry().finish_release(release.id, release.side);
            log::debug!(
                "{} released {:?} side at {} ({} of {} pages cleared{})",
                pid,
                release.side,
                release.base,
                cleared,
                release.frames.len(),
                if removed { ", record removed" } else { "" }
            );
            Ok(())
        }
        Err(err) => {
            scope.registry().abort_release(release.id, release.side);
            Err(err)
        }
    }
}

/// Drops the entries of a claimed range that still point at the recorded frames.
///
/// Pages the process already gave back some other way (for example by shrinking) are
/// skipped, so each entry gives up exactly the one reference it held.
fn clear(
    pmm: &PhysicalMemoryManager,
    scope: &mut LockScope<'_>,
    pid: Pid,
    release: &Release,
) -> Result<usize, ShmError> {
    let mut process = scope.member(pid)?;
    let Some(space) = process.space_mut() else {
        return Ok(0);
    };

    let mut cleared = 0;
    for (va, &frame) in pages(release.base, release.length).zip(&release.frames) {
        match space.translate(pmm, va) {
            Some((mapped, _)) if mapped == frame => {
                space.unmap_page(pmm, va);
                pmm.release_reference(frame);
                cleared += 1;
                log::trace!("{}: unmapped {} ({})", pid, va, frame);
            }
            _ => {}
        }
    }

    // Only drop back to the base once nothing in the range is mapped any more.
    let ends_at_size = release.base.as_usize() + release.length == space.size();
    if ends_at_size
        && pages(release.base, release.length).all(|va| space.translate(pmm, va).is_none())
    {
        space.set_size(release.base.as_usize());
    }
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kernel, KernelConfig};

    #[test]
    fn range_validation() {
        assert_eq!(validate_range(PAGE_SIZE, PAGE_SIZE), Ok(VirtualAddress::new(PAGE_SIZE)));
        assert_eq!(validate_range(0, 0), Err(ShmError::InvalidRange));
        assert_eq!(validate_range(3, PAGE_SIZE), Err(ShmError::InvalidRange));
        assert_eq!(validate_range(0, PAGE_SIZE - 1), Err(ShmError::InvalidRange));
        assert_eq!(
            validate_range(MAX_VA - PAGE_SIZE, PAGE_SIZE * 2),
            Err(ShmError::InvalidRange)
        );
        assert_eq!(
            validate_range(usize::MAX & !(PAGE_SIZE - 1), PAGE_SIZE),
            Err(ShmError::InvalidRange)
        );
    }

    #[test]
    fn hole_in_source_releases_borrowed_frames() {
        let kernel = Kernel::new(KernelConfig::default().with_frames(256));
        let source = kernel.spawn("source").unwrap();
        let target = kernel.spawn("target").unwrap();
        {
            // Claim a page past the mapped image without backing it.
            let mut process = kernel.processes().find(source).unwrap();
            process.space_mut().unwrap().set_size(PAGE_SIZE * 2);
        }
        let (frame, _) = kernel.translate(source, 0).unwrap();

        let mut scope = kernel.lock_scope();
        assert_eq!(
            establish(kernel.pmm(), &mut scope, source, target, 0, PAGE_SIZE * 2),
            Err(ShmError::InvalidRange)
        );
        assert_eq!(kernel.pmm().reference_count(frame), 1);
        assert_eq!(kernel.mapping_count(), 0);
    }

    #[test]
    fn installed_entries_are_marked_shared() {
        let kernel = Kernel::new(KernelConfig::default().with_frames(256));
        let source = kernel.spawn("source").unwrap();
        let target = kernel.spawn("target").unwrap();

        let mut scope = kernel.lock_scope();
        let base = establish(kernel.pmm(), &mut scope, source, target, 0, PAGE_SIZE).unwrap();
        let (frame, flags) = kernel.translate(target, base.as_usize()).unwrap();
        let (original, source_flags) = kernel.translate(source, 0).unwrap();
        assert_eq!(frame, original);
        assert!(flags.is_shared());
        assert!(flags.is_writable());
        assert!(!source_flags.is_shared());

        let va = base.as_usize();
        assert_eq!(
            release(kernel.pmm(), &mut scope, target, va + PAGE_SIZE, PAGE_SIZE),
            Err(ShmError::NoSuchMapping)
        );
        release(kernel.pmm(), &mut scope, target, va, PAGE_SIZE).unwrap();
        assert_eq!(kernel.pmm().reference_count(original), 1);
    }
}
