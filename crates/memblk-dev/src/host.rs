//! Boundary with the host block layer.
//!
//! The driver never talks to a real kernel directly. Everything it needs from the host
//! (device numbers, disk descriptors, request queues, publishing) goes through [`BlockHost`], so
//! the same lifecycle code runs against a kernel binding or against [`crate::sim::SimHost`].

use crate::device::{BlockDeviceOps, DeviceShared};
use crate::dispatch::QueueOps;
use crate::tag_set::TagSet;
use std::sync::Arc;
use thiserror::Error;

/// Opaque handle to a disk descriptor allocated by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskId(pub u64);

/// Opaque handle to a request queue allocated by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("device number {major} is busy")]
    Busy { major: u32 },

    #[error("no free device numbers")]
    NoFreeMajor,

    #[error("out of memory")]
    NoMemory,

    #[error("unknown disk {0:?}")]
    NoSuchDisk(DiskId),

    #[error("unknown queue {0:?}")]
    NoSuchQueue(QueueId),

    #[error("disk {0:?} is not published")]
    NotPublished(DiskId),

    #[error("all {depth} tags are in use")]
    QueueFull { depth: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Fields of the host's disk descriptor that the driver fills in before publishing.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub major: u32,
    pub first_minor: u32,
    pub fops: BlockDeviceOps,
    pub queue: QueueId,
    pub private_data: Arc<DeviceShared>,
    pub disk_name: String,
    /// Advertised capacity in 512-byte sectors.
    pub capacity_sectors: u64,
}

/// Services the host block layer provides to a block driver.
///
/// Release methods cannot fail; the driver only calls them for handles it actually holds.
pub trait BlockHost {
    /// Reserves device number `major` for `name`. `major == 0` asks the host to pick one.
    fn register_blkdev(&self, major: u32, name: &str) -> Result<u32, HostError>;

    fn unregister_blkdev(&self, major: u32, name: &str);

    /// Allocates a disk descriptor with room for `minors` minor numbers.
    fn alloc_disk(&self, minors: u32) -> Result<DiskId, HostError>;

    fn put_disk(&self, disk: DiskId);

    fn set_disk_info(&self, disk: DiskId, info: DiskInfo) -> Result<(), HostError>;

    /// Builds a single hardware queue over `tag_set`. The host invokes `ops.queue_rq` with
    /// `queuedata` for every request it dispatches, possibly from several threads at once.
    fn init_queue(
        &self,
        tag_set: Arc<TagSet>,
        ops: QueueOps,
        queuedata: Arc<DeviceShared>,
    ) -> Result<QueueId, HostError>;

    /// Drains and frees the queue together with its tag set.
    fn cleanup_queue(&self, queue: QueueId);

    /// Makes the disk reachable for I/O. Must only be called once the disk is fully set up.
    fn add_disk(&self, disk: DiskId) -> Result<(), HostError>;

    fn del_gendisk(&self, disk: DiskId);
}

impl<H: BlockHost + ?Sized> BlockHost for Arc<H> {
    fn register_blkdev(&self, major: u32, name: &str) -> Result<u32, HostError> {
        (**self).register_blkdev(major, name)
    }

    fn unregister_blkdev(&self, major: u32, name: &str) {
        (**self).unregister_blkdev(major, name)
    }

    fn alloc_disk(&self, minors: u32) -> Result<DiskId, HostError> {
        (**self).alloc_disk(minors)
    }

    fn put_disk(&self, disk: DiskId) {
        (**self).put_disk(disk)
    }

    fn set_disk_info(&self, disk: DiskId, info: DiskInfo) -> Result<(), HostError> {
        (**self).set_disk_info(disk, info)
    }

    fn init_queue(
        &self,
        tag_set: Arc<TagSet>,
        ops: QueueOps,
        queuedata: Arc<DeviceShared>,
    ) -> Result<QueueId, HostError> {
        (**self).init_queue(tag_set, ops, queuedata)
    }

    fn cleanup_queue(&self, queue: QueueId) {
        (**self).cleanup_queue(queue)
    }

    fn add_disk(&self, disk: DiskId) -> Result<(), HostError> {
        (**self).add_disk(disk)
    }

    fn del_gendisk(&self, disk: DiskId) {
        (**self).del_gendisk(disk)
    }
}
