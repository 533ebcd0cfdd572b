//! Errors reported by the shared memory subsystem.

use core::fmt;

use pmm::{AllocError, MapError, VmError};

/// Why a shared memory or process operation failed.
///
/// Only success or failure crosses the syscall boundary; the variants exist for logging and
/// for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmError {
    /// The target process does not exist or is no longer live.
    NoSuchProcess,
    /// The caller holds no mapping with exactly the given base and length.
    NoSuchMapping,
    /// The range is unaligned, empty, or not backed by the caller's memory.
    InvalidRange,
    /// The destination has no room left to place the range.
    AddressSpaceExhausted,
    /// A frame, page table, or mapping record could not be allocated.
    OutOfMemory,
    /// Every process slot is in use.
    ProcessTableFull,
}

impl ShmError {
    /// Returns `true` for the "not found" family.
    pub fn is_not_found(self) -> bool {
        matches!(self, ShmError::NoSuchProcess | ShmError::NoSuchMapping)
    }

    /// Returns `true` for the "resource exhausted" family.
    pub fn is_resource_exhausted(self) -> bool {
        matches!(self, ShmError::OutOfMemory | ShmError::ProcessTableFull)
    }
}

impl From<AllocError> for ShmError {
    fn from(_: AllocError) -> Self {
        ShmError::OutOfMemory
    }
}

impl From<MapError> for ShmError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => ShmError::OutOfMemory,
            MapError::AlreadyMapped => ShmError::InvalidRange,
        }
    }
}

impl From<VmError> for ShmError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::AddressSpaceExhausted => ShmError::AddressSpaceExhausted,
            VmError::OutOfMemory => ShmError::OutOfMemory,
            VmError::BadAddress => ShmError::InvalidRange,
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::NoSuchProcess => write!(f, "no such process"),
            ShmError::NoSuchMapping => write!(f, "no such mapping"),
            ShmError::InvalidRange => write!(f, "invalid range"),
            ShmError::AddressSpaceExhausted => write!(f, "out of address space"),
            ShmError::OutOfMemory => write!(f, "out of memory"),
            ShmError::ProcessTableFull => write!(f, "process table full"),
        }
    }
}

impl core::error::Error for ShmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmm_errors_convert() {
        assert_eq!(ShmError::from(AllocError::OutOfMemory), ShmError::OutOfMemory);
        assert_eq!(ShmError::from(MapError::OutOfMemory), ShmError::OutOfMemory);
        assert_eq!(
            ShmError::from(VmError::AddressSpaceExhausted),
            ShmError::AddressSpaceExhausted
        );
        assert_eq!(ShmError::from(VmError::BadAddress), ShmError::InvalidRange);
    }

    #[test]
    fn families() {
        assert!(ShmError::NoSuchMapping.is_not_found());
        assert!(ShmError::ProcessTableFull.is_resource_exhausted());
        assert!(!ShmError::InvalidRange.is_not_found());
    }
}
