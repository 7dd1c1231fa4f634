//! Request dispatch: the callback the host queue invokes for every request.

use crate::device::DeviceShared;
use crate::request::{BlkStatus, BlockRequest};
use crate::segment::process_segment;
use core::fmt;

/// Request positions are always expressed in 512-byte units, whatever the logical block size.
pub const SECTOR_SHIFT: u32 = 9;

pub type QueueRqFn = fn(&DeviceShared, &mut dyn BlockRequest) -> BlkStatus;

/// Queue operations table registered with the host when the queue is built.
#[derive(Clone, Copy)]
pub struct QueueOps {
    pub queue_rq: QueueRqFn,
}

impl fmt::Debug for QueueOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueOps").finish_non_exhaustive()
    }
}

pub const MEMBLK_MQ_OPS: QueueOps = QueueOps { queue_rq };

/// Result of walking a request's segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub status: BlkStatus,
    /// Bytes successfully transferred.
    pub bytes: u64,
    /// Device offset after the last transferred byte.
    pub end_offset: u64,
}

/// Serves one request taken from the host queue.
///
/// Runs concurrently with other invocations; all per-request state (offset cursor, byte count)
/// is local to this call.
///
/// A failed request is ended with `IoErr` even if bytes remain after the fault.
///
/// # Panics
///
/// Panics if the host reports part of a successful request still outstanding after the final
/// update: every segment was served, so the request can be neither completed nor retried.
pub fn queue_rq(dev: &DeviceShared, rq: &mut dyn BlockRequest) -> BlkStatus {
    rq.start();

    let outcome = do_request(dev, rq);

    let outstanding = rq.update(outcome.status, outcome.bytes);
    if outstanding && !outcome.status.is_ok() {
        tracing::debug!(
            device = dev.name(),
            bytes = outcome.bytes,
            "ending failed request with bytes outstanding"
        );
    } else if outstanding {
        panic!(
            "{}: host reports request outstanding after {} bytes ({})",
            dev.name(),
            outcome.bytes,
            outcome.status
        );
    }

    rq.end(outcome.status);
    outcome.status
}

/// Moves the data of `rq`, segment by segment, between host memory and the backing store.
///
/// Stops at the first segment that cannot be transferred; the bytes reported are those moved
/// before it.
pub fn do_request(dev: &DeviceShared, rq: &mut dyn BlockRequest) -> RequestOutcome {
    let direction = rq.direction();
    let sector = rq.start_sector();

    let Some(start) = sector.checked_mul(1u64 << SECTOR_SHIFT) else {
        tracing::warn!(device = dev.name(), sector, "request sector overflows device offset");
        return RequestOutcome {
            status: BlkStatus::IoErr,
            bytes: 0,
            end_offset: 0,
        };
    };

    let Some(store) = dev.store() else {
        tracing::warn!(device = dev.name(), "request dispatched before backing store exists");
        return RequestOutcome {
            status: BlkStatus::IoErr,
            bytes: 0,
            end_offset: start,
        };
    };

    tracing::debug!(device = dev.name(), ?direction, sector, "serving request");

    let mut status = BlkStatus::Ok;
    let mut offset = start;
    let mut bytes = 0u64;
    for segment in rq.segments() {
        let len = segment.len();
        match process_segment(store, segment, offset, direction) {
            Ok(transfer) => {
                bytes += transfer.bytes as u64;
                offset = transfer.next_offset;
            }
            Err(err) => {
                tracing::warn!(
                    device = dev.name(),
                    ?direction,
                    offset,
                    len,
                    error = %err,
                    "segment transfer failed"
                );
                status = BlkStatus::IoErr;
                break;
            }
        }
    }

    RequestOutcome {
        status,
        bytes,
        end_offset: offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Direction, Segment, Segments};
    use memblk_storage::BackingStore;

    /// Minimal request that only records what the dispatcher did to it.
    struct Recorder {
        sector: u64,
        direction: Direction,
        bufs: Vec<Vec<u8>>,
        calls: Vec<&'static str>,
        outstanding: bool,
    }

    impl Recorder {
        fn new(direction: Direction, sector: u64, bufs: Vec<Vec<u8>>) -> Self {
            Self {
                sector,
                direction,
                bufs,
                calls: Vec::new(),
                outstanding: false,
            }
        }
    }

    impl BlockRequest for Recorder {
        fn start_sector(&self) -> u64 {
            self.sector
        }

        fn direction(&self) -> Direction {
            self.direction
        }

        fn start(&mut self) {
            self.calls.push("start");
        }

        fn segments(&mut self) -> Segments<'_> {
            self.calls.push("segments");
            Box::new(self.bufs.iter_mut().map(|b| Segment::new(b)))
        }

        fn update(&mut self, _status: BlkStatus, _nr_bytes: u64) -> bool {
            self.calls.push("update");
            self.outstanding
        }

        fn end(&mut self, _status: BlkStatus) {
            self.calls.push("end");
        }
    }

    fn device(size: usize) -> DeviceShared {
        let dev = DeviceShared::new("memblk-test");
        dev.install_store(BackingStore::new(size).unwrap()).unwrap();
        dev
    }

    #[test]
    fn host_calls_happen_once_in_order() {
        let dev = device(16);
        let mut rq = Recorder::new(Direction::Write, 0, vec![vec![1; 4], vec![2; 4]]);
        assert_eq!(queue_rq(&dev, &mut rq), BlkStatus::Ok);
        assert_eq!(rq.calls, ["start", "segments", "update", "end"]);
    }

    #[test]
    fn stops_at_first_faulting_segment() {
        let dev = device(8);
        let mut rq = Recorder::new(
            Direction::Write,
            0,
            vec![vec![0xAA; 4], vec![0xBB; 8], vec![0xCC; 2]],
        );

        let outcome = do_request(&dev, &mut rq);
        assert_eq!(
            outcome,
            RequestOutcome {
                status: BlkStatus::IoErr,
                bytes: 4,
                end_offset: 4,
            }
        );
        // The third segment would have fit but is never written.
        assert_eq!(
            dev.store().unwrap().snapshot(),
            [0xAAu8, 0xAA, 0xAA, 0xAA, 0, 0, 0, 0]
        );
    }

    #[test]
    fn missing_store_fails_request() {
        let dev = DeviceShared::new("memblk-test");
        let mut rq = Recorder::new(Direction::Read, 0, vec![vec![0; 4]]);
        assert_eq!(queue_rq(&dev, &mut rq), BlkStatus::IoErr);
        assert_eq!(rq.calls, ["start", "update", "end"]);
    }

    #[test]
    fn overflowing_sector_fails_request() {
        let dev = device(8);
        let mut rq = Recorder::new(Direction::Read, u64::MAX, vec![vec![0; 4]]);
        assert_eq!(do_request(&dev, &mut rq).status, BlkStatus::IoErr);
    }

    #[test]
    fn failed_request_with_outstanding_bytes_is_ended() {
        let dev = device(8);
        // Sector 1 is past the 8-byte store; the host still counts all 8 bytes as pending.
        let mut rq = Recorder::new(Direction::Write, 1, vec![vec![0xFF; 8]]);
        rq.outstanding = true;

        assert_eq!(queue_rq(&dev, &mut rq), BlkStatus::IoErr);
        assert_eq!(rq.calls, ["start", "segments", "update", "end"]);
        assert_eq!(dev.store().unwrap().snapshot(), [0u8; 8]);
    }

    #[test]
    #[should_panic(expected = "outstanding")]
    fn outstanding_bytes_after_update_is_fatal() {
        let dev = device(8);
        let mut rq = Recorder::new(Direction::Write, 0, vec![vec![0; 8]]);
        rq.outstanding = true;
        queue_rq(&dev, &mut rq);
    }
}
