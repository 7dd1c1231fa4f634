//! Dispatch context: the tag set that lets several requests be in flight at once.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

/// Default number of tags, i.e. requests that may be dispatched concurrently.
pub const DEFAULT_QUEUE_DEPTH: u32 = 128;

/// Upper bound on the queue depth accepted by [`TagSet::new`].
pub const MAX_QUEUE_DEPTH: u32 = 10240;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        /// The host may merge adjacent requests before dispatching them.
        const SHOULD_MERGE = 1 << 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagSetError {
    #[error("queue depth {depth} outside 1..={}", MAX_QUEUE_DEPTH)]
    InvalidDepth { depth: u32 },
}

/// Fixed pool of request tags.
///
/// Tags are handed out lock-free from a bitmap; a [`TagGuard`] returns its tag when dropped.
#[derive(Debug)]
pub struct TagSet {
    depth: u32,
    flags: QueueFlags,
    words: Box<[AtomicU64]>,
    in_flight: AtomicU32,
}

impl TagSet {
    pub fn new(depth: u32, flags: QueueFlags) -> Result<Self, TagSetError> {
        if depth == 0 || depth > MAX_QUEUE_DEPTH {
            return Err(TagSetError::InvalidDepth { depth });
        }
        let nr_words = depth.div_ceil(64) as usize;
        let words = (0..nr_words).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            depth,
            flags,
            words,
            in_flight: AtomicU32::new(0),
        })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Claims a free tag, or returns `None` if every tag is in use.
    pub fn get_tag(&self) -> Option<TagGuard<'_>> {
        for (word_idx, word) in self.words.iter().enumerate() {
            let base = word_idx as u32 * 64;
            let valid = (self.depth - base).min(64);
            let mask = if valid == 64 {
                u64::MAX
            } else {
                (1u64 << valid) - 1
            };

            let mut cur = word.load(Ordering::Relaxed);
            loop {
                let free = !cur & mask;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros();
                match word.compare_exchange_weak(
                    cur,
                    cur | (1u64 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.in_flight.fetch_add(1, Ordering::AcqRel);
                        return Some(TagGuard {
                            set: self,
                            tag: base + bit,
                        });
                    }
                    Err(actual) => cur = actual,
                }
            }
        }
        None
    }

    fn put_tag(&self, tag: u32) {
        let word = &self.words[(tag / 64) as usize];
        let prev = word.fetch_and(!(1u64 << (tag % 64)), Ordering::AcqRel);
        debug_assert!(prev & (1u64 << (tag % 64)) != 0, "tag {tag} released twice");
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A claimed tag. Released back to its [`TagSet`] on drop.
#[derive(Debug)]
pub struct TagGuard<'a> {
    set: &'a TagSet,
    tag: u32,
}

impl TagGuard<'_> {
    pub fn tag(&self) -> u32 {
        self.tag
    }
}

impl Drop for TagGuard<'_> {
    fn drop(&mut self) {
        self.set.put_tag(self.tag);
    }
}
