//! Device bring-up and teardown against a [`BlockHost`].

use crate::config::{ConfigError, DeviceConfig};
use crate::device::{DeviceShared, MEMBLK_FOPS};
use crate::dispatch::MEMBLK_MQ_OPS;
use crate::host::{BlockHost, DiskId, DiskInfo, HostError, QueueId};
use crate::tag_set::{TagSet, TagSetError};
use memblk_storage::{BackingStore, StoreError};
use std::sync::Arc;
use thiserror::Error;

const EBUSY: i32 = 16;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;

/// Progress of a device through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Uninitialized,
    /// Device number reserved.
    Registered,
    /// Disk descriptor, tag set and queue exist.
    QueueReady,
    /// Reachable for I/O.
    Published,
    /// No longer reachable; resources still being released.
    Unpublished,
    TornDown,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("device is already set up ({0:?})")]
    AlreadySetUp(DeviceState),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to register block device numbers")]
    Register(#[source] HostError),

    #[error("failed to allocate disk")]
    AllocDisk(#[source] HostError),

    #[error("failed to build tag set")]
    TagSet(#[from] TagSetError),

    #[error("failed to initialise request queue")]
    InitQueue(#[source] HostError),

    #[error("failed to configure disk")]
    ConfigureDisk(#[source] HostError),

    #[error("cannot allocate memory for the backing store")]
    Store(#[source] StoreError),

    #[error("failed to publish disk")]
    Publish(#[source] HostError),
}

impl SetupError {
    /// Errno-style code for the failure, as a module loader would report it.
    pub fn errno(&self) -> i32 {
        match self {
            SetupError::Register(_) | SetupError::AlreadySetUp(_) => EBUSY,
            SetupError::Config(_) | SetupError::TagSet(_) => EINVAL,
            SetupError::AllocDisk(_)
            | SetupError::InitQueue(_)
            | SetupError::ConfigureDisk(_)
            | SetupError::Store(_)
            | SetupError::Publish(_) => ENOMEM,
        }
    }
}

/// One RAM disk and every host resource it holds.
///
/// Resources are acquired by [`setup`](Self::setup) and released by
/// [`teardown`](Self::teardown), which is also run on drop. Each handle is kept as an `Option`
/// so teardown releases exactly what was acquired, once.
pub struct BlockDev<H: BlockHost> {
    host: H,
    config: DeviceConfig,
    state: DeviceState,
    major: Option<u32>,
    disk: Option<DiskId>,
    tag_set: Option<Arc<TagSet>>,
    queue: Option<QueueId>,
    store_allocated: bool,
    published: bool,
    shared: Arc<DeviceShared>,
}

impl<H: BlockHost> BlockDev<H> {
    pub fn new(host: H, config: DeviceConfig) -> Self {
        let shared = Arc::new(DeviceShared::new(config.name.clone()));
        Self {
            host,
            config,
            state: DeviceState::Uninitialized,
            major: None,
            disk: None,
            tag_set: None,
            queue: None,
            store_allocated: false,
            published: false,
            shared,
        }
    }

    /// Creates and publishes a device in one step.
    pub fn create(host: H, config: DeviceConfig) -> Result<Self, SetupError> {
        let mut dev = Self::new(host, config);
        dev.setup()?;
        Ok(dev)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn major(&self) -> Option<u32> {
        self.major
    }

    pub fn disk(&self) -> Option<DiskId> {
        self.disk
    }

    pub fn queue(&self) -> Option<QueueId> {
        self.queue
    }

    pub fn tag_set(&self) -> Option<&Arc<TagSet>> {
        self.tag_set.as_ref()
    }

    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub fn store(&self) -> Option<&BackingStore> {
        self.shared.store()
    }

    /// Brings the device up and publishes it.
    ///
    /// On failure, every step that already completed is undone before the error is returned.
    pub fn setup(&mut self) -> Result<(), SetupError> {
        match self.state {
            DeviceState::Uninitialized | DeviceState::TornDown => {}
            state => return Err(SetupError::AlreadySetUp(state)),
        }

        if let Err(err) = self.try_setup() {
            tracing::error!(device = %self.config.name, error = %err, "memblk setup failed");
            self.teardown();
            return Err(err);
        }

        tracing::info!(
            device = %self.config.name,
            major = ?self.major,
            "memblk device {} inserted successfully",
            self.config.name
        );
        Ok(())
    }

    fn try_setup(&mut self) -> Result<(), SetupError> {
        self.config.validate()?;

        // The previous incarnation's shared state is gone once torn down; start from scratch so
        // open counts and the store slot are fresh.
        if self.state == DeviceState::TornDown {
            self.shared = Arc::new(DeviceShared::new(self.config.name.clone()));
        }

        let major = self
            .host
            .register_blkdev(self.config.major, &self.config.name)
            .map_err(SetupError::Register)?;
        self.major = Some(major);
        self.state = DeviceState::Registered;

        let disk = self
            .host
            .alloc_disk(self.config.minors)
            .map_err(SetupError::AllocDisk)?;
        self.disk = Some(disk);

        let tag_set = Arc::new(TagSet::new(
            self.config.queue_depth,
            self.config.queue_flags,
        )?);
        let queue = self
            .host
            .init_queue(Arc::clone(&tag_set), MEMBLK_MQ_OPS, Arc::clone(&self.shared))
            .map_err(SetupError::InitQueue)?;
        self.tag_set = Some(tag_set);
        self.queue = Some(queue);
        self.state = DeviceState::QueueReady;

        self.host
            .set_disk_info(
                disk,
                DiskInfo {
                    major,
                    first_minor: 0,
                    fops: MEMBLK_FOPS,
                    queue,
                    private_data: Arc::clone(&self.shared),
                    disk_name: self.config.name.clone(),
                    capacity_sectors: self.config.capacity_sectors(),
                },
            )
            .map_err(SetupError::ConfigureDisk)?;

        let store = BackingStore::new(self.config.buffer_size).map_err(SetupError::Store)?;
        if self.shared.install_store(store).is_err() {
            // `shared` is fresh for every setup, so the slot is always empty here.
            tracing::warn!(device = %self.config.name, "backing store already installed");
        }
        self.store_allocated = true;

        if (self.config.buffer_size as u64) < self.config.capacity_bytes() {
            tracing::warn!(
                device = %self.config.name,
                buffer_size = self.config.buffer_size,
                capacity = self.config.capacity_bytes(),
                "advertised capacity exceeds backing buffer; I/O past the buffer will fail"
            );
        }

        // Publishing makes the disk reachable immediately, so it comes last.
        self.host.add_disk(disk).map_err(SetupError::Publish)?;
        self.published = true;
        self.state = DeviceState::Published;

        Ok(())
    }

    /// Releases everything `setup` acquired, newest first. Safe to call at any point, any
    /// number of times.
    pub fn teardown(&mut self) {
        if self.state == DeviceState::Uninitialized || self.state == DeviceState::TornDown {
            return;
        }

        if self.published {
            if let Some(disk) = self.disk {
                self.host.del_gendisk(disk);
            }
            self.published = false;
            self.state = DeviceState::Unpublished;
        }

        if let Some(queue) = self.queue.take() {
            self.host.cleanup_queue(queue);
        }
        self.tag_set = None;

        if let Some(disk) = self.disk.take() {
            self.host.put_disk(disk);
        }

        if self.store_allocated {
            match Arc::get_mut(&mut self.shared) {
                Some(shared) => {
                    shared.release_store();
                }
                None => tracing::warn!(
                    device = %self.config.name,
                    "backing store still referenced by the host after queue release"
                ),
            }
            self.store_allocated = false;
        }

        if let Some(major) = self.major.take() {
            self.host.unregister_blkdev(major, &self.config.name);
        }

        self.state = DeviceState::TornDown;
        tracing::info!(
            device = %self.config.name,
            "memblk device {} removed successfully",
            self.config.name
        );
    }
}

impl<H: BlockHost> Drop for BlockDev<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}
