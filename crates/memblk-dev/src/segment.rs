//! Segment I/O: moves one scatter-gather segment between host memory and the backing store.

use crate::request::{Direction, Segment};
use memblk_storage::{checked_range, BackingStore, StoreError};

/// Result of a completed segment transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes moved; always the segment length on success.
    pub bytes: usize,
    /// Device offset immediately after the segment.
    pub next_offset: u64,
}

/// Transfers `segment` to or from `store` at device byte `offset`.
///
/// The whole range is bounds-checked before any byte moves, so a fault leaves both the store and
/// the segment untouched.
pub fn process_segment(
    store: &BackingStore,
    mut segment: Segment<'_>,
    offset: u64,
    direction: Direction,
) -> Result<Transfer, StoreError> {
    let len = segment.len();
    checked_range(offset, len, store.capacity_bytes())?;
    let next_offset = offset
        .checked_add(len as u64)
        .ok_or(StoreError::OffsetOverflow)?;

    match direction {
        Direction::Write => {
            tracing::trace!(offset, len, "writing segment to memblk device");
            store.write_at(offset, segment.as_slice())?;
        }
        Direction::Read => {
            tracing::trace!(offset, len, "reading segment from memblk device");
            store.read_at(offset, segment.as_mut_slice())?;
        }
    }

    Ok(Transfer {
        bytes: len,
        next_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_copies_segment_into_store() {
        let store = BackingStore::new(8).unwrap();
        let mut data = *b"wxyz";

        let t = process_segment(&store, Segment::new(&mut data), 2, Direction::Write).unwrap();
        assert_eq!(
            t,
            Transfer {
                bytes: 4,
                next_offset: 6,
            }
        );
        assert_eq!(store.snapshot(), b"\0\0wxyz\0\0");
    }

    #[test]
    fn read_copies_store_into_segment() {
        let store = BackingStore::new(8).unwrap();
        store.write_at(0, b"01234567").unwrap();
        let mut buf = [0u8; 3];

        let t = process_segment(&store, Segment::new(&mut buf), 5, Direction::Read).unwrap();
        assert_eq!(t.next_offset, 8);
        assert_eq!(&buf, b"567");
    }

    #[test]
    fn fault_leaves_segment_and_store_untouched() {
        let store = BackingStore::new(8).unwrap();
        store.write_at(0, &[0x42; 8]).unwrap();

        let mut buf = [0xAAu8; 4];
        let err = process_segment(&store, Segment::new(&mut buf), 6, Direction::Read).unwrap_err();
        assert!(matches!(err, StoreError::OutOfBounds { .. }));
        assert_eq!(buf, [0xAA; 4]);

        let mut data = [0x99u8; 4];
        assert!(process_segment(&store, Segment::new(&mut data), 6, Direction::Write).is_err());
        assert_eq!(store.snapshot(), vec![0x42; 8]);
    }

    #[test]
    fn empty_segment_is_a_no_op() {
        let store = BackingStore::new(8).unwrap();
        let t = process_segment(&store, Segment::new(&mut []), 3, Direction::Write).unwrap();
        assert_eq!(t.bytes, 0);
        assert_eq!(t.next_offset, 3);
    }
}
