//! Host-side request contract consumed by the dispatcher.

use core::fmt;

/// Data-flow direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Store → segment memory.
    Read,
    /// Segment memory → store.
    Write,
}

/// Completion status reported to the host for a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlkStatus {
    Ok,
    IoErr,
}

impl BlkStatus {
    pub fn is_ok(self) -> bool {
        self == BlkStatus::Ok
    }
}

impl fmt::Display for BlkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::IoErr => write!(f, "I/O error"),
        }
    }
}

/// One scatter-gather segment: a host-owned memory region that is part of a request payload.
pub struct Segment<'a> {
    buf: &'a mut [u8],
}

impl<'a> Segment<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &*self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut *self.buf
    }
}

impl fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment").field("len", &self.buf.len()).finish()
    }
}

/// Lazy, finite sequence of the segments belonging to one request.
pub type Segments<'a> = Box<dyn Iterator<Item = Segment<'a>> + 'a>;

/// A request taken from the host queue.
///
/// The dispatcher calls [`start`](Self::start), [`update`](Self::update) and
/// [`end`](Self::end) exactly once each, in that order.
pub trait BlockRequest {
    /// First sector addressed by the request, in 512-byte units.
    fn start_sector(&self) -> u64;

    fn direction(&self) -> Direction;

    /// Notifies the host that processing has begun. This arms the host's request timeout.
    fn start(&mut self);

    /// Returns the request's segments in host order.
    ///
    /// The sequence is not restartable: once handed out, a second call yields no segments.
    fn segments(&mut self) -> Segments<'_>;

    /// Reports `nr_bytes` processed with `status`.
    ///
    /// Returns `true` if the host still considers part of the request outstanding. The host may
    /// do so after an error status too; the dispatcher then ends the request with that error.
    fn update(&mut self, status: BlkStatus, nr_bytes: u64) -> bool;

    /// Ends the request with its final status.
    fn end(&mut self, status: BlkStatus);
}
