use memblk_dev::sim::{RequestCall, SimHost, SimRequest};
use memblk_dev::{do_request, BlkStatus, BlockDev, BlockRequest, DeviceConfig, DiskId, HostError};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn published(config: DeviceConfig) -> (Arc<SimHost>, BlockDev<Arc<SimHost>>, DiskId) {
    init_tracing();
    let host = Arc::new(SimHost::new());
    let dev = BlockDev::create(Arc::clone(&host), config).unwrap();
    let disk = dev.disk().unwrap();
    (host, dev, disk)
}

fn submit(host: &SimHost, disk: DiskId, rq: &mut SimRequest) -> BlkStatus {
    host.submit(disk, rq).unwrap()
}

#[test]
fn write_then_read_back() {
    let (host, dev, disk) = published(DeviceConfig::default());

    let mut write = SimRequest::write(0, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
    assert_eq!(submit(&host, disk, &mut write), BlkStatus::Ok);
    assert_eq!(
        write.calls(),
        [
            RequestCall::Started,
            RequestCall::Updated {
                status: BlkStatus::Ok,
                nr_bytes: 8,
            },
            RequestCall::Ended(BlkStatus::Ok),
        ]
    );

    let mut read = SimRequest::read(0, &[8]);
    assert_eq!(submit(&host, disk, &mut read), BlkStatus::Ok);
    assert_eq!(read.data(), [1u8, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(read.completion(), Some((BlkStatus::Ok, 8)));
    assert_eq!(dev.store().unwrap().snapshot(), [1u8, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn multi_segment_request_is_laid_out_contiguously() {
    let (host, dev, disk) = published(DeviceConfig::default());

    let mut write = SimRequest::write(0, vec![vec![0xAA; 4], vec![0xBB; 4]]);
    assert_eq!(submit(&host, disk, &mut write), BlkStatus::Ok);
    assert_eq!(
        dev.store().unwrap().snapshot(),
        [0xAAu8, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]
    );

    let mut read = SimRequest::read(0, &[2, 6]);
    assert_eq!(submit(&host, disk, &mut read), BlkStatus::Ok);
    assert_eq!(
        read.segment_data(),
        [vec![0xAAu8, 0xAA], vec![0xAAu8, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]]
    );
}

#[test]
fn read_does_not_modify_store_and_write_does_not_modify_segments() {
    let (host, dev, disk) = published(DeviceConfig::default());
    dev.store().unwrap().write_at(0, &[9; 8]).unwrap();

    let mut write = SimRequest::write(0, vec![vec![5; 4]]);
    submit(&host, disk, &mut write);
    assert_eq!(write.segment_data(), [vec![5u8; 4]]);

    let before = dev.store().unwrap().snapshot();
    let mut read = SimRequest::read(0, &[8]);
    submit(&host, disk, &mut read);
    assert_eq!(dev.store().unwrap().snapshot(), before);
}

#[test]
fn out_of_bounds_request_fails_without_touching_store() {
    let (host, dev, disk) = published(DeviceConfig::default());
    dev.store().unwrap().write_at(0, &[7; 8]).unwrap();

    // Sector 1 starts at byte 512, far past the 8-byte buffer.
    let mut write = SimRequest::write(1, vec![vec![0xFF; 8]]);
    assert_eq!(submit(&host, disk, &mut write), BlkStatus::IoErr);
    assert_eq!(
        write.calls(),
        [
            RequestCall::Started,
            RequestCall::Updated {
                status: BlkStatus::IoErr,
                nr_bytes: 0,
            },
            RequestCall::Ended(BlkStatus::IoErr),
        ]
    );
    assert_eq!(dev.store().unwrap().snapshot(), [7u8; 8]);

    let mut read = SimRequest::read(1, &[8]);
    assert_eq!(submit(&host, disk, &mut read), BlkStatus::IoErr);
    assert_eq!(read.data(), [0u8; 8]);

    // The device keeps serving in-bounds requests afterwards.
    let mut read = SimRequest::read(0, &[8]);
    assert_eq!(submit(&host, disk, &mut read), BlkStatus::Ok);
    assert_eq!(read.data(), [7u8; 8]);
}

#[test]
fn straddling_segment_fails_after_the_segments_that_fit() {
    let (host, dev, disk) = published(DeviceConfig::default());

    let mut write = SimRequest::write(0, vec![vec![1; 6], vec![2; 4]]);
    assert_eq!(submit(&host, disk, &mut write), BlkStatus::IoErr);
    assert_eq!(write.completion(), Some((BlkStatus::IoErr, 6)));
    assert_eq!(dev.store().unwrap().snapshot(), [1u8, 1, 1, 1, 1, 1, 0, 0]);
}

#[test]
fn larger_buffer_serves_requests_beyond_sector_zero() {
    let config = DeviceConfig {
        buffer_size: 4096,
        ..DeviceConfig::default()
    };
    let (host, dev, disk) = published(config);

    let mut write = SimRequest::write(2, vec![vec![0x5A; 512]]);
    assert_eq!(submit(&host, disk, &mut write), BlkStatus::Ok);
    assert_eq!(dev.store().unwrap().read(1024, 512).unwrap(), vec![0x5Au8; 512]);
    assert_eq!(dev.store().unwrap().read(0, 1024).unwrap(), vec![0u8; 1024]);
}

#[test]
fn segments_already_consumed_are_not_walked_again() {
    let (_host, dev, _disk) = published(DeviceConfig::default());

    let mut write = SimRequest::write(0, vec![vec![3; 8]]);
    assert_eq!(write.segments().count(), 1);

    let outcome = do_request(dev.shared(), &mut write);
    assert_eq!(outcome.status, BlkStatus::Ok);
    assert_eq!(outcome.bytes, 0);
    assert_eq!(outcome.end_offset, 0);
    assert_eq!(dev.store().unwrap().snapshot(), [0u8; 8]);
}

#[test]
fn unpublished_disk_rejects_requests() {
    let (host, mut dev, disk) = published(DeviceConfig::default());
    dev.teardown();

    let mut read = SimRequest::read(0, &[8]);
    assert_eq!(
        host.submit(disk, &mut read).unwrap_err(),
        HostError::NoSuchDisk(disk)
    );
    assert!(read.calls().is_empty());
}

#[test]
fn request_without_segments_completes_with_zero_bytes() {
    let (host, dev, disk) = published(DeviceConfig::default());

    let mut write = SimRequest::write(0, Vec::new());
    assert_eq!(submit(&host, disk, &mut write), BlkStatus::Ok);
    assert_eq!(write.completion(), Some((BlkStatus::Ok, 0)));
    assert_eq!(dev.store().unwrap().snapshot(), [0u8; 8]);
}
