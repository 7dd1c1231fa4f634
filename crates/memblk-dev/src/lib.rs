//! RAM-backed block device driver core.
//!
//! The driver registers a fixed-capacity disk with a host block layer and services the requests
//! that the host queues for it against an in-memory [`memblk_storage::BackingStore`].
//!
//! - [`lifecycle::BlockDev`]: owns the device; brings it up against a [`host::BlockHost`] and
//!   tears it down again in reverse order
//! - [`dispatch::queue_rq`]: per-request callback installed in the host queue
//! - [`segment::process_segment`]: moves one scatter-gather segment to or from the store
//! - [`tag_set::TagSet`]: dispatch context bounding the number of requests in flight
//! - [`sim`]: in-process host used by the tests and by embedders without a kernel
//!
//! The host is always an injected dependency; nothing in this crate is process-global.

pub mod config;
pub mod device;
pub mod dispatch;
pub mod host;
pub mod lifecycle;
pub mod request;
pub mod segment;
pub mod sim;
pub mod tag_set;

pub use config::{ConfigError, DeviceConfig};
pub use device::{BlockDeviceOps, Bookkeeping, DeviceShared, OpenMode, MEMBLK_FOPS};
pub use dispatch::{do_request, queue_rq, QueueOps, RequestOutcome, MEMBLK_MQ_OPS, SECTOR_SHIFT};
pub use host::{BlockHost, DiskId, DiskInfo, HostError, QueueId};
pub use lifecycle::{BlockDev, DeviceState, SetupError};
pub use request::{BlkStatus, BlockRequest, Direction, Segment, Segments};
pub use segment::{process_segment, Transfer};
pub use tag_set::{QueueFlags, TagGuard, TagSet, TagSetError};
