//! Per-device state shared with the host, and the block device operations table.

use bitflags::bitflags;
use core::fmt;
use memblk_storage::BackingStore;
use std::sync::{Mutex, OnceLock};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Device-level counters. Guarded by the device mutex; never touched on the I/O path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bookkeeping {
    /// Handles currently open.
    pub openers: u32,
    /// Total successful opens since setup.
    pub total_opens: u64,
}

/// Driver-private data handed to the host: reachable from the disk (`private_data`) and from
/// the queue (`queuedata`).
pub struct DeviceShared {
    name: String,
    store: OnceLock<BackingStore>,
    bookkeeping: Mutex<Bookkeeping>,
}

impl DeviceShared {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: OnceLock::new(),
            bookkeeping: Mutex::new(Bookkeeping::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing store, once it has been allocated.
    pub fn store(&self) -> Option<&BackingStore> {
        self.store.get()
    }

    /// Installs the backing store. Hands the store back if one is already installed.
    pub fn install_store(&self, store: BackingStore) -> Result<(), BackingStore> {
        self.store.set(store)
    }

    /// Frees the backing store. Requires exclusive access, i.e. the host holds no reference.
    pub fn release_store(&mut self) -> Option<BackingStore> {
        self.store.take()
    }

    pub fn bookkeeping(&self) -> Bookkeeping {
        *self
            .bookkeeping
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn update_bookkeeping(&self, f: impl FnOnce(&mut Bookkeeping)) {
        let mut guard = self
            .bookkeeping
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        f(&mut guard);
    }
}

impl fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceShared")
            .field("name", &self.name)
            .field("store", &self.store.get())
            .finish_non_exhaustive()
    }
}

pub type OpenFn = fn(&DeviceShared, OpenMode) -> Result<(), crate::host::HostError>;
pub type ReleaseFn = fn(&DeviceShared, OpenMode);

/// Operations table attached to the disk; the host calls these when the device node is opened
/// and closed.
#[derive(Clone, Copy)]
pub struct BlockDeviceOps {
    pub open: OpenFn,
    pub release: ReleaseFn,
}

impl fmt::Debug for BlockDeviceOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDeviceOps").finish_non_exhaustive()
    }
}

pub const MEMBLK_FOPS: BlockDeviceOps = BlockDeviceOps {
    open: memblk_open,
    release: memblk_release,
};

fn memblk_open(dev: &DeviceShared, mode: OpenMode) -> Result<(), crate::host::HostError> {
    dev.update_bookkeeping(|b| {
        b.openers += 1;
        b.total_opens += 1;
    });
    tracing::info!(device = dev.name(), ?mode, "device opened successfully");
    Ok(())
}

fn memblk_release(dev: &DeviceShared, mode: OpenMode) {
    dev.update_bookkeeping(|b| b.openers = b.openers.saturating_sub(1));
    tracing::info!(device = dev.name(), ?mode, "device closed successfully");
}
