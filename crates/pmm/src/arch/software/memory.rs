//! Emulated physical memory.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{PAGE_SIZE, validate_physical};

/// Emulated physical memory for software simulation.
///
/// Memory is stored as 64-bit atomic words so page table entries can be loaded and stored
/// whole, and byte accesses from different cores never tear each other's neighbours. The
/// emulated machine is little-endian.
pub struct EmulatedMemory {
    words: Box<[AtomicU64]>,
}

impl EmulatedMemory {
    /// Creates a new zeroed memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a whole number of pages or exceeds the physical address width.
    pub fn new(size: usize) -> Self {
        assert!(
            size % PAGE_SIZE == 0,
            "emulated memory must be a whole number of pages"
        );
        assert!(
            size == 0 || validate_physical(size - 1),
            "emulated memory exceeds maximum physical width"
        );

        let words = (0..size / 8).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    /// Returns the size of the emulated memory region in bytes.
    pub fn size(&self) -> usize {
        self.words.len() * 8
    }

    /// Loads the 64-bit word at `phys`, which must be 8-byte aligned.
    pub fn load_u64(&self, phys: usize) -> u64 {
        self.word(phys).load(Ordering::Acquire)
    }

    /// Stores a 64-bit word at `phys`, which must be 8-byte aligned.
    pub fn store_u64(&self, phys: usize, value: u64) {
        self.word(phys).store(value, Ordering::Release);
    }

    /// Copies bytes starting at `phys` into `buf`.
    pub fn read(&self, phys: usize, buf: &mut [u8]) {
        self.check_range(phys, buf.len());
        for (offset, byte) in buf.iter_mut().enumerate() {
            let addr = phys + offset;
            let word = self.words[addr / 8].load(Ordering::Acquire);
            *byte = (word >> Self::shift(addr)) as u8;
        }
    }

    /// Copies `bytes` into memory starting at `phys`.
    pub fn write(&self, phys: usize, bytes: &[u8]) {
        self.check_range(phys, bytes.len());
        for (offset, &byte) in bytes.iter().enumerate() {
            let addr = phys + offset;
            let shift = Self::shift(addr);
            let mask = 0xFFu64 << shift;
            let _ = self.words[addr / 8].fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some((w & !mask) | ((byte as u64) << shift))
            });
        }
    }

    /// Zeroes `len` bytes starting at the 8-byte aligned address `phys`.
    pub fn zero(&self, phys: usize, len: usize) {
        assert!(phys % 8 == 0 && len % 8 == 0, "zeroing must be word aligned");
        self.check_range(phys, len);
        for word in &self.words[phys / 8..(phys + len) / 8] {
            word.store(0, Ordering::Release);
        }
    }

    /// Copies `len` bytes from `src` to `dst`; both must be 8-byte aligned.
    pub fn copy(&self, src: usize, dst: usize, len: usize) {
        assert!(
            src % 8 == 0 && dst % 8 == 0 && len % 8 == 0,
            "copies must be word aligned"
        );
        self.check_range(src, len);
        self.check_range(dst, len);
        for i in 0..len / 8 {
            let value = self.words[src / 8 + i].load(Ordering::Acquire);
            self.words[dst / 8 + i].store(value, Ordering::Release);
        }
    }

    fn word(&self, phys: usize) -> &AtomicU64 {
        assert!(phys % 8 == 0, "word access must be 8-byte aligned");
        self.check_range(phys, 8);
        &self.words[phys / 8]
    }

    fn check_range(&self, phys: usize, len: usize) {
        assert!(
            phys.checked_add(len).is_some_and(|end| end <= self.size()),
            "physical address out of bounds"
        );
    }

    const fn shift(addr: usize) -> u32 {
        ((addr % 8) * 8) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed() {
        let mem = EmulatedMemory::new(PAGE_SIZE * 2);
        assert_eq!(mem.size(), PAGE_SIZE * 2);
        let mut buf = [0xAAu8; 16];
        mem.read(PAGE_SIZE - 8, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn unaligned_bytes_round_trip() {
        let mem = EmulatedMemory::new(PAGE_SIZE);
        mem.write(5, b"Hello daddy");

        let mut buf = [0u8; 11];
        mem.read(5, &mut buf);
        assert_eq!(&buf, b"Hello daddy");

        // Neighbouring bytes are untouched.
        let mut edge = [0xFFu8; 1];
        mem.read(4, &mut edge);
        assert_eq!(edge[0], 0);
    }

    #[test]
    fn words_are_little_endian() {
        let mem = EmulatedMemory::new(PAGE_SIZE);
        mem.store_u64(8, 0x0807_0605_0403_0201);
        let mut buf = [0u8; 2];
        mem.read(8, &mut buf);
        assert_eq!(buf, [0x01, 0x02]);
    }

    #[test]
    fn zero_and_copy_pages() {
        let mem = EmulatedMemory::new(PAGE_SIZE * 2);
        mem.write(0, &[7u8; PAGE_SIZE]);
        mem.copy(0, PAGE_SIZE, PAGE_SIZE);
        mem.zero(0, PAGE_SIZE);

        let mut first = [1u8; PAGE_SIZE];
        let mut second = [0u8; PAGE_SIZE];
        mem.read(0, &mut first);
        mem.read(PAGE_SIZE, &mut second);
        assert_eq!(first, [0u8; PAGE_SIZE]);
        assert_eq!(second, [7u8; PAGE_SIZE]);
    }

    #[test]
    #[should_panic(expected = "physical address out of bounds")]
    fn rejects_out_of_bounds() {
        let mem = EmulatedMemory::new(PAGE_SIZE);
        mem.write(PAGE_SIZE - 1, b"ab");
    }
}
