use crate::util::checked_range;
use crate::{Result, StoreError};
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Fixed-capacity, byte-addressed buffer backing a RAM disk.
///
/// The request dispatcher runs concurrently from several hardware contexts and does not
/// serialize requests against each other, so every access goes through `&self`. Bytes are stored
/// as [`AtomicU8`] and accessed with `Relaxed` ordering: concurrent access to overlapping ranges
/// is memory-safe but has no ordering or isolation guarantee.
pub struct BackingStore {
    bytes: Box<[AtomicU8]>,
}

impl BackingStore {
    /// Allocates a zero-filled store of `size` bytes.
    ///
    /// Allocation failure is reported instead of aborting the process.
    pub fn new(size: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| StoreError::AllocationFailed { size })?;
        bytes.resize_with(size, || AtomicU8::new(0));
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let src = self.range(offset, dst.len())?;
        for (slot, byte) in dst.iter_mut().zip(src) {
            *slot = byte.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copies `src` into the store starting at `offset`.
    pub fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let dst = self.range(offset, src.len())?;
        for (slot, byte) in dst.iter().zip(src.iter().copied()) {
            slot.store(byte, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Returns a copy of `len` bytes starting at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_at(offset, &mut out)?;
        Ok(out)
    }

    /// Returns a copy of the whole store.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    fn range(&self, offset: u64, len: usize) -> Result<&[AtomicU8]> {
        checked_range(offset, len, self.capacity_bytes())?;
        // `checked_range` guarantees `offset + len <= self.bytes.len()`, so both fit in `usize`.
        let start = usize::try_from(offset).map_err(|_| StoreError::OffsetOverflow)?;
        Ok(&self.bytes[start..start + len])
    }
}

impl fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingStore")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_zeroed() {
        let store = BackingStore::new(8).unwrap();
        assert_eq!(store.len(), 8);
        assert_eq!(store.snapshot(), vec![0u8; 8]);
    }

    #[test]
    fn write_then_read_back() {
        let store = BackingStore::new(8).unwrap();
        store.write_at(2, b"abc").unwrap();

        let mut buf = [0u8; 3];
        store.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(store.read(0, 8).unwrap(), b"\0\0abc\0\0\0");
    }

    #[test]
    fn out_of_bounds_write_leaves_store_untouched() {
        let store = BackingStore::new(8).unwrap();
        store.write_at(0, &[0x11; 8]).unwrap();

        let err = store.write_at(6, &[0xFF; 4]).unwrap_err();
        assert_eq!(
            err,
            StoreError::OutOfBounds {
                offset: 6,
                len: 4,
                capacity: 8,
            }
        );
        assert_eq!(store.snapshot(), vec![0x11; 8]);
    }

    #[test]
    fn out_of_bounds_read_leaves_destination_untouched() {
        let store = BackingStore::new(8).unwrap();
        let mut buf = [0xAAu8; 16];
        assert!(store.read_at(0, &mut buf).is_err());
        assert!(buf.iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn zero_length_access_at_end_is_allowed() {
        let store = BackingStore::new(8).unwrap();
        store.write_at(8, &[]).unwrap();
        store.read_at(8, &mut []).unwrap();
    }

    #[test]
    fn impossible_allocation_is_reported() {
        let err = BackingStore::new(usize::MAX).unwrap_err();
        assert_eq!(err, StoreError::AllocationFailed { size: usize::MAX });
    }

    #[test]
    fn empty_store() {
        let store = BackingStore::new(0).unwrap();
        assert!(store.is_empty());
        assert!(store.write_at(0, &[1]).is_err());
    }
}
