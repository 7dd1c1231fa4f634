use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for backing store operations.
///
/// Bounds failures are reported before any byte is moved, so an `Err` from the store always
/// means the buffer was left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("cannot allocate {size} bytes for the backing store")]
    AllocationFailed { size: usize },
}
