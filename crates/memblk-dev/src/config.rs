use crate::tag_set::{QueueFlags, DEFAULT_QUEUE_DEPTH, MAX_QUEUE_DEPTH};
use thiserror::Error;

pub const DEFAULT_DEVICE_NAME: &str = "memblk";
pub const DEFAULT_NR_SECTORS: u64 = 1024;
pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_BUFFER_SIZE: usize = 8;

/// Size of the host's disk name field, terminator included.
pub const DISK_NAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("device name must be 1..{} bytes, got {len}", DISK_NAME_LEN)]
    InvalidName { len: usize },

    #[error("sector size {0} is not a power of two in 512..=4096")]
    InvalidSectorSize(u32),

    #[error("device capacity must be at least one sector")]
    ZeroCapacity,

    #[error("device needs at least one minor number")]
    ZeroMinors,

    #[error("queue depth {depth} outside 1..={}", MAX_QUEUE_DEPTH)]
    InvalidQueueDepth { depth: u32 },
}

/// Geometry and naming of one RAM disk.
///
/// The advertised capacity (`nr_sectors * sector_size`) and the backing buffer are sized
/// independently; requests beyond the buffer fail with an I/O error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    /// Requested major number; `0` lets the host allocate one.
    pub major: u32,
    pub minors: u32,
    pub nr_sectors: u64,
    pub sector_size: u32,
    pub buffer_size: usize,
    pub queue_depth: u32,
    pub queue_flags: QueueFlags,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            major: 0,
            minors: 1,
            nr_sectors: DEFAULT_NR_SECTORS,
            sector_size: DEFAULT_SECTOR_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            queue_flags: QueueFlags::SHOULD_MERGE,
        }
    }
}

impl DeviceConfig {
    /// Builds a config from `MEMBLK_*` environment variables, falling back to the defaults for
    /// unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let name = lookup("MEMBLK_NAME")
            .map(|v| v.trim().to_string())
            .unwrap_or(defaults.name);
        let major = parse_var(&lookup, "MEMBLK_MAJOR")?.unwrap_or(defaults.major);
        let minors = parse_var(&lookup, "MEMBLK_MINORS")?.unwrap_or(defaults.minors);
        let nr_sectors = parse_var(&lookup, "MEMBLK_NR_SECTORS")?.unwrap_or(defaults.nr_sectors);
        let sector_size =
            parse_var(&lookup, "MEMBLK_SECTOR_SIZE")?.unwrap_or(defaults.sector_size);
        let buffer_size =
            parse_var(&lookup, "MEMBLK_BUFFER_SIZE")?.unwrap_or(defaults.buffer_size);
        let queue_depth =
            parse_var(&lookup, "MEMBLK_QUEUE_DEPTH")?.unwrap_or(defaults.queue_depth);

        let config = Self {
            name,
            major,
            minors,
            nr_sectors,
            sector_size,
            buffer_size,
            queue_depth,
            queue_flags: defaults.queue_flags,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.len() >= DISK_NAME_LEN {
            return Err(ConfigError::InvalidName {
                len: self.name.len(),
            });
        }
        if !self.sector_size.is_power_of_two() || !(512..=4096).contains(&self.sector_size) {
            return Err(ConfigError::InvalidSectorSize(self.sector_size));
        }
        if self.nr_sectors == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.minors == 0 {
            return Err(ConfigError::ZeroMinors);
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(ConfigError::InvalidQueueDepth {
                depth: self.queue_depth,
            });
        }
        Ok(())
    }

    /// Advertised capacity in bytes, saturating on overflow.
    pub fn capacity_bytes(&self) -> u64 {
        self.nr_sectors.saturating_mul(u64::from(self.sector_size))
    }

    /// Advertised capacity in 512-byte units, as the host block layer counts it.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_bytes() >> crate::dispatch::SECTOR_SHIFT
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(key)),
    }
}
