use crate::{Result, StoreError};

/// Checks that `[offset, offset + len)` lies inside a store of `capacity` bytes.
pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let len_u64 = u64::try_from(len).map_err(|_| StoreError::OffsetOverflow)?;
    let end = offset
        .checked_add(len_u64)
        .ok_or(StoreError::OffsetOverflow)?;
    if end > capacity {
        return Err(StoreError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}
