//! In-process host block layer.
//!
//! [`SimHost`] implements [`BlockHost`] without a kernel: it hands out device numbers and
//! handles, keeps an ordered log of every resource acquired and released, and dispatches
//! [`SimRequest`]s through the queue callback the driver registered, claiming a tag per request
//! exactly as a multi-queue block layer would. Misuse of the host contract (double release,
//! tearing down a queue with requests in flight, ...) is recorded as a violation instead of
//! panicking, so tests can assert on it.

use crate::device::{DeviceShared, OpenMode};
use crate::dispatch::QueueOps;
use crate::host::{BlockHost, DiskId, DiskInfo, HostError, QueueId};
use crate::request::{BlkStatus, BlockRequest, Direction, Segment, Segments};
use crate::tag_set::TagSet;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Highest dynamically allocated major number; allocation walks downwards from here.
pub const DYNAMIC_MAJOR_MAX: u32 = 254;
/// Lowest dynamically allocated major number.
pub const DYNAMIC_MAJOR_MIN: u32 = 234;
/// Largest major number the host accepts.
pub const MAJOR_MAX: u32 = 511;

/// Host operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStep {
    RegisterBlkdev,
    AllocDisk,
    InitQueue,
    SetDiskInfo,
    AddDisk,
}

/// Resource-level events in the order the host observed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Registered { major: u32, name: String },
    Unregistered { major: u32 },
    DiskAllocated(DiskId),
    DiskConfigured(DiskId),
    DiskPublished(DiskId),
    DiskUnpublished(DiskId),
    DiskReleased(DiskId),
    QueueCreated { queue: QueueId, depth: u32 },
    QueueReleased(QueueId),
}

/// Snapshot of the host-side disk descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskView {
    pub major: u32,
    pub first_minor: u32,
    pub minors: u32,
    pub queue: QueueId,
    pub disk_name: String,
    pub capacity_sectors: u64,
    pub published: bool,
}

/// Resources the host currently holds on behalf of drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub majors: BTreeSet<u32>,
    pub disks: BTreeSet<DiskId>,
    pub queues: BTreeSet<QueueId>,
    pub published: BTreeSet<DiskId>,
}

impl LiveResources {
    pub fn is_empty(&self) -> bool {
        self.majors.is_empty()
            && self.disks.is_empty()
            && self.queues.is_empty()
            && self.published.is_empty()
    }
}

struct SimDisk {
    minors: u32,
    info: Option<DiskInfo>,
    published: bool,
}

struct SimQueue {
    tag_set: Arc<TagSet>,
    ops: QueueOps,
    queuedata: Arc<DeviceShared>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    majors: BTreeMap<u32, String>,
    disks: BTreeMap<DiskId, SimDisk>,
    queues: BTreeMap<QueueId, Arc<SimQueue>>,
    fail_at: HashSet<HostStep>,
    events: Vec<HostEvent>,
    violations: Vec<String>,
}

impl SimState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_fail(&self, step: HostStep) -> Result<(), HostError> {
        if self.fail_at.contains(&step) {
            tracing::debug!(?step, "injected host failure");
            return Err(match step {
                HostStep::RegisterBlkdev => HostError::NoFreeMajor,
                HostStep::AllocDisk
                | HostStep::InitQueue
                | HostStep::SetDiskInfo
                | HostStep::AddDisk => HostError::NoMemory,
            });
        }
        Ok(())
    }

    fn violation(&mut self, msg: String) {
        tracing::warn!("host contract violation: {msg}");
        self.violations.push(msg);
    }
}

/// Simulated host block layer. `Sync`: requests may be submitted from many threads.
#[derive(Default)]
pub struct SimHost {
    state: Mutex<SimState>,
}

impl SimHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Makes every future call of `step` fail.
    pub fn fail_at(&self, step: HostStep) {
        self.lock().fail_at.insert(step);
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.lock().events.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub fn live_resources(&self) -> LiveResources {
        let state = self.lock();
        LiveResources {
            majors: state.majors.keys().copied().collect(),
            disks: state.disks.keys().copied().collect(),
            queues: state.queues.keys().copied().collect(),
            published: state
                .disks
                .iter()
                .filter(|(_, d)| d.published)
                .map(|(id, _)| *id)
                .collect(),
        }
    }

    pub fn disk(&self, disk: DiskId) -> Option<DiskView> {
        let state = self.lock();
        let d = state.disks.get(&disk)?;
        let info = d.info.as_ref()?;
        Some(DiskView {
            major: info.major,
            first_minor: info.first_minor,
            minors: d.minors,
            queue: info.queue,
            disk_name: info.disk_name.clone(),
            capacity_sectors: info.capacity_sectors,
            published: d.published,
        })
    }

    /// Looks up the published disk registered under `name`.
    pub fn find_disk(&self, name: &str) -> Option<DiskId> {
        let state = self.lock();
        state.disks.iter().find_map(|(id, d)| {
            let info = d.info.as_ref()?;
            (d.published && info.disk_name == name).then_some(*id)
        })
    }

    /// Dispatches `rq` to a published disk through its queue callback.
    ///
    /// The host lock is not held during dispatch, so concurrent submissions reach the driver
    /// concurrently, bounded by the queue's tag set.
    pub fn submit(&self, disk: DiskId, rq: &mut dyn BlockRequest) -> Result<BlkStatus, HostError> {
        let queue = {
            let state = self.lock();
            let d = state.disks.get(&disk).ok_or(HostError::NoSuchDisk(disk))?;
            let info = match (&d.info, d.published) {
                (Some(info), true) => info,
                _ => return Err(HostError::NotPublished(disk)),
            };
            let queue = state
                .queues
                .get(&info.queue)
                .ok_or(HostError::NoSuchQueue(info.queue))?;
            Arc::clone(queue)
        };

        let tag = queue.tag_set.get_tag().ok_or(HostError::QueueFull {
            depth: queue.tag_set.depth(),
        })?;
        tracing::trace!(?disk, tag = tag.tag(), "dispatching request");
        let status = (queue.ops.queue_rq)(&queue.queuedata, rq);
        drop(tag);
        Ok(status)
    }

    /// Opens the device node of `disk`, invoking the driver's `open` operation.
    pub fn open(&self, disk: DiskId, mode: OpenMode) -> Result<(), HostError> {
        let (fops, data) = self.fops(disk)?;
        (fops.open)(&data, mode)
    }

    /// Closes the device node of `disk`, invoking the driver's `release` operation.
    pub fn release(&self, disk: DiskId, mode: OpenMode) -> Result<(), HostError> {
        let (fops, data) = self.fops(disk)?;
        (fops.release)(&data, mode);
        Ok(())
    }

    fn fops(
        &self,
        disk: DiskId,
    ) -> Result<(crate::device::BlockDeviceOps, Arc<DeviceShared>), HostError> {
        let state = self.lock();
        let d = state.disks.get(&disk).ok_or(HostError::NoSuchDisk(disk))?;
        match (&d.info, d.published) {
            (Some(info), true) => Ok((info.fops, Arc::clone(&info.private_data))),
            _ => Err(HostError::NotPublished(disk)),
        }
    }
}

impl BlockHost for SimHost {
    fn register_blkdev(&self, major: u32, name: &str) -> Result<u32, HostError> {
        let mut state = self.lock();
        state.check_fail(HostStep::RegisterBlkdev)?;
        if name.is_empty() {
            return Err(HostError::InvalidArgument("empty device name"));
        }

        let major = if major == 0 {
            (DYNAMIC_MAJOR_MIN..=DYNAMIC_MAJOR_MAX)
                .rev()
                .find(|m| !state.majors.contains_key(m))
                .ok_or(HostError::NoFreeMajor)?
        } else if major > MAJOR_MAX {
            return Err(HostError::InvalidArgument("major number out of range"));
        } else if state.majors.contains_key(&major) {
            return Err(HostError::Busy { major });
        } else {
            major
        };

        state.majors.insert(major, name.to_string());
        state.events.push(HostEvent::Registered {
            major,
            name: name.to_string(),
        });
        Ok(major)
    }

    fn unregister_blkdev(&self, major: u32, name: &str) {
        let mut state = self.lock();
        match state.majors.get(&major).cloned() {
            Some(owner) if owner == name => {
                state.majors.remove(&major);
                state.events.push(HostEvent::Unregistered { major });
            }
            Some(owner) => {
                let msg = format!("unregister of major {major} by {name:?}, owned by {owner:?}");
                state.violation(msg);
            }
            None => state.violation(format!("unregister of unknown major {major}")),
        }
    }

    fn alloc_disk(&self, minors: u32) -> Result<DiskId, HostError> {
        let mut state = self.lock();
        state.check_fail(HostStep::AllocDisk)?;
        if minors == 0 {
            return Err(HostError::InvalidArgument("disk needs at least one minor"));
        }
        let disk = DiskId(state.next_handle());
        state.disks.insert(
            disk,
            SimDisk {
                minors,
                info: None,
                published: false,
            },
        );
        state.events.push(HostEvent::DiskAllocated(disk));
        Ok(disk)
    }

    fn put_disk(&self, disk: DiskId) {
        let mut state = self.lock();
        match state.disks.get(&disk).map(|d| d.published) {
            Some(false) => {
                state.disks.remove(&disk);
                state.events.push(HostEvent::DiskReleased(disk));
            }
            Some(true) => state.violation(format!("put_disk on published disk {disk:?}")),
            None => state.violation(format!("put_disk on unknown disk {disk:?}")),
        }
    }

    fn set_disk_info(&self, disk: DiskId, info: DiskInfo) -> Result<(), HostError> {
        let mut state = self.lock();
        state.check_fail(HostStep::SetDiskInfo)?;
        if !state.queues.contains_key(&info.queue) {
            return Err(HostError::NoSuchQueue(info.queue));
        }
        if !state.majors.contains_key(&info.major) {
            return Err(HostError::InvalidArgument("disk major is not registered"));
        }
        let d = state
            .disks
            .get_mut(&disk)
            .ok_or(HostError::NoSuchDisk(disk))?;
        if d.published {
            return Err(HostError::InvalidArgument("disk already published"));
        }
        d.info = Some(info);
        state.events.push(HostEvent::DiskConfigured(disk));
        Ok(())
    }

    fn init_queue(
        &self,
        tag_set: Arc<TagSet>,
        ops: QueueOps,
        queuedata: Arc<DeviceShared>,
    ) -> Result<QueueId, HostError> {
        let mut state = self.lock();
        state.check_fail(HostStep::InitQueue)?;
        let queue = QueueId(state.next_handle());
        let depth = tag_set.depth();
        state.queues.insert(
            queue,
            Arc::new(SimQueue {
                tag_set,
                ops,
                queuedata,
            }),
        );
        state.events.push(HostEvent::QueueCreated { queue, depth });
        Ok(queue)
    }

    fn cleanup_queue(&self, queue: QueueId) {
        let mut state = self.lock();
        let Some(q) = state.queues.remove(&queue) else {
            state.violation(format!("cleanup of unknown queue {queue:?}"));
            return;
        };
        if !q.tag_set.is_idle() {
            let msg = format!(
                "queue {queue:?} released with {} requests in flight",
                q.tag_set.in_flight()
            );
            state.violation(msg);
        }
        let still_attached = state
            .disks
            .values()
            .any(|d| d.published && d.info.as_ref().is_some_and(|i| i.queue == queue));
        if still_attached {
            state.violation(format!("queue {queue:?} released under a published disk"));
        }
        state.events.push(HostEvent::QueueReleased(queue));
    }

    fn add_disk(&self, disk: DiskId) -> Result<(), HostError> {
        let mut state = self.lock();
        state.check_fail(HostStep::AddDisk)?;
        let d = state
            .disks
            .get_mut(&disk)
            .ok_or(HostError::NoSuchDisk(disk))?;
        if d.info.is_none() {
            return Err(HostError::InvalidArgument("disk published before being configured"));
        }
        if d.published {
            return Err(HostError::InvalidArgument("disk already published"));
        }
        d.published = true;
        state.events.push(HostEvent::DiskPublished(disk));
        Ok(())
    }

    fn del_gendisk(&self, disk: DiskId) {
        let mut state = self.lock();
        match state.disks.get_mut(&disk) {
            Some(d) if d.published => {
                d.published = false;
                // The host drops its references to driver data with the disk.
                d.info = None;
                state.events.push(HostEvent::DiskUnpublished(disk));
            }
            Some(_) => state.violation(format!("del_gendisk on unpublished disk {disk:?}")),
            None => state.violation(format!("del_gendisk on unknown disk {disk:?}")),
        }
    }
}

/// A record of one host call made by the dispatcher on a [`SimRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCall {
    Started,
    Updated { status: BlkStatus, nr_bytes: u64 },
    Ended(BlkStatus),
}

/// Request built in host memory: a direction, a start sector and a list of segment buffers.
#[derive(Debug, Clone)]
pub struct SimRequest {
    sector: u64,
    direction: Direction,
    segments: Vec<Vec<u8>>,
    segments_taken: bool,
    calls: Vec<RequestCall>,
}

impl SimRequest {
    pub fn new(direction: Direction, sector: u64, segments: Vec<Vec<u8>>) -> Self {
        Self {
            sector,
            direction,
            segments,
            segments_taken: false,
            calls: Vec::new(),
        }
    }

    /// Write request whose payload is `segments`, in order.
    pub fn write(sector: u64, segments: Vec<Vec<u8>>) -> Self {
        Self::new(Direction::Write, sector, segments)
    }

    /// Read request with zero-filled segments of the given lengths.
    pub fn read(sector: u64, lens: &[usize]) -> Self {
        Self::new(
            Direction::Read,
            sector,
            lens.iter().map(|len| vec![0u8; *len]).collect(),
        )
    }

    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    pub fn segment_data(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// All segment buffers concatenated.
    pub fn data(&self) -> Vec<u8> {
        self.segments.concat()
    }

    pub fn calls(&self) -> &[RequestCall] {
        &self.calls
    }

    /// Final status and bytes reported, once the request has ended.
    pub fn completion(&self) -> Option<(BlkStatus, u64)> {
        let ended = self.calls.iter().rev().find_map(|c| match c {
            RequestCall::Ended(status) => Some(*status),
            _ => None,
        })?;
        let nr_bytes = self.calls.iter().find_map(|c| match c {
            RequestCall::Updated { nr_bytes, .. } => Some(*nr_bytes),
            _ => None,
        })?;
        Some((ended, nr_bytes))
    }
}

impl BlockRequest for SimRequest {
    fn start_sector(&self) -> u64 {
        self.sector
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn start(&mut self) {
        self.calls.push(RequestCall::Started);
    }

    fn segments(&mut self) -> Segments<'_> {
        if std::mem::replace(&mut self.segments_taken, true) {
            return Box::new(std::iter::empty());
        }
        Box::new(self.segments.iter_mut().map(|s| Segment::new(s)))
    }

    fn update(&mut self, status: BlkStatus, nr_bytes: u64) -> bool {
        self.calls.push(RequestCall::Updated { status, nr_bytes });
        nr_bytes < self.total_len()
    }

    fn end(&mut self, status: BlkStatus) {
        self.calls.push(RequestCall::Ended(status));
    }
}
