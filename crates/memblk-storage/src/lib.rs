//! In-memory backing store for the memblk RAM disk.
//!
//! The block layer deals in sectors, but the backing store itself is byte-addressed:
//!
//! - [`BackingStore`]: fixed-capacity buffer with bounds-checked `read_at`/`write_at`
//! - [`StoreError`]: the failures a store access can produce
//! - [`checked_range`]: the bounds check shared by the store and its callers
//!
//! Sector arithmetic and request handling live in `memblk-dev`.

mod error;
mod store;
mod util;

pub use error::{Result, StoreError};
pub use store::BackingStore;
pub use util::checked_range;
