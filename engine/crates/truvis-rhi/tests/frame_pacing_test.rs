use std::thread;
use std::time::{Duration, Instant};

use truvis_rhi::resource::desc::{BufferDesc, BufferUsage, MemoryLocality};
use truvis_rhi::{BufferHandle, CommandStream, Device, FrameIndex, QueueKind, RhiConfig, RhiError, WorkerId};

fn storage_buffer(device: &Device, label: &str) -> BufferHandle {
    device
        .create_buffer(BufferDesc::new(
            256,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            MemoryLocality::DeviceLocal,
            label,
        ))
        .unwrap()
}

fn submit_empty(device: &Device) -> FrameIndex {
    let frame = device.begin_frame().unwrap();
    device.submit_frame(frame, Vec::new()).unwrap();
    frame
}

#[test]
fn test_frames_in_flight_never_exceed_limit() {
    let config = RhiConfig::default()
        .with_frames_in_flight(2)
        .with_fence_timeout(Duration::from_millis(100));
    let (device, backend) = Device::headless(config).unwrap();

    backend.pause();
    assert_eq!(submit_empty(&device), FrameIndex(0));
    assert_eq!(submit_empty(&device), FrameIndex(1));
    assert_eq!(device.stats().in_flight, 2);

    // 第三帧需要等待第 0 帧，GPU 暂停时只能超时
    match device.begin_frame() {
        Err(RhiError::FenceTimeout { frame, .. }) => assert_eq!(frame, FrameIndex(0)),
        other => panic!("expected fence timeout, got {other:?}"),
    }
    assert_eq!(device.stats().in_flight, 2);
    assert_eq!(device.current_frame(), None);

    backend.resume();
    let frame = device.begin_frame().unwrap();
    assert_eq!(frame, FrameIndex(2));
    device.submit_frame(frame, Vec::new()).unwrap();

    let stats = device.stats();
    assert!(stats.frames.max_in_flight <= 2);
    assert_eq!(stats.frames.fence_timeouts, 1);
}

#[test]
fn test_begin_frame_blocks_on_oldest_slot() {
    let config = RhiConfig::default()
        .with_frames_in_flight(2)
        .with_fence_timeout(Duration::from_secs(10));
    let (device, backend) = Device::headless(config).unwrap();

    backend.pause();
    submit_empty(&device);
    submit_empty(&device);

    let resumer = {
        let backend = backend.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            backend.resume();
        })
    };

    let start = Instant::now();
    let frame = device.begin_frame().unwrap();
    let waited = start.elapsed();
    resumer.join().unwrap();

    assert_eq!(frame, FrameIndex(2));
    assert!(waited >= Duration::from_millis(80), "begin_frame returned after {waited:?}");
    assert!(device.stats().completed_frame >= Some(FrameIndex(0)));
    assert!(device.frame_timer(|t| t.last_stall()) >= Duration::from_millis(80));
}

#[test]
fn test_blocked_begin_frame_does_not_stall_other_threads() {
    let config = RhiConfig::default()
        .with_frames_in_flight(2)
        .with_fence_timeout(Duration::from_secs(10));
    let (device, backend) = Device::headless(config).unwrap();

    backend.pause();
    submit_empty(&device);
    submit_empty(&device);

    let waiter = {
        let device = device.clone();
        thread::spawn(move || device.begin_frame())
    };
    thread::sleep(Duration::from_millis(50));

    // begin_frame 正在等待槽位 0，其他线程依然可以回收和查询
    let start = Instant::now();
    let report = device.retire_completed().unwrap();
    assert_eq!(report.completed, None);
    assert_eq!(device.stats().in_flight, 2);
    assert!(start.elapsed() < Duration::from_secs(1), "retire_completed blocked for {:?}", start.elapsed());

    backend.resume();
    assert_eq!(waiter.join().unwrap().unwrap(), FrameIndex(2));
}

#[test]
fn test_destroyed_resource_is_kept_until_its_frame_completes() {
    let (device, backend) = Device::headless(RhiConfig::default()).unwrap();
    let buffer = storage_buffer(&device, "in-flight");

    backend.pause();
    let frame = device.begin_frame().unwrap();
    let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
    let mut session = recorder.begin(frame).unwrap();
    session.fill_buffer(buffer, 0, 256, 0xdead_beef).unwrap();
    let stream = session.end().unwrap();
    let fence = device.submit_frame(frame, vec![stream]).unwrap();

    let objects = backend.object_count();
    device.destroy(buffer).unwrap();
    assert!(matches!(device.label_of(buffer), Err(RhiError::StaleHandle { .. })));
    assert_eq!(device.stats().pending_destroy, 1);

    // GPU 还没有执行这一帧
    let report = device.retire_completed().unwrap();
    assert_eq!(report.resources_reclaimed, 0);
    assert_eq!(backend.object_count(), objects);
    assert_eq!(device.stats().allocator.pending_frees, 1);

    backend.resume();
    assert!(fence.wait(Duration::from_secs(5)).unwrap());
    let report = device.retire_completed().unwrap();
    assert_eq!(report.completed, Some(frame));
    assert_eq!(report.resources_reclaimed, 1);
    assert_eq!(report.memory_blocks_reclaimed, 1);
    assert_eq!(backend.object_count(), objects - 1);

    let stats = device.stats();
    assert_eq!(stats.pending_destroy, 0);
    assert_eq!(stats.allocator.pending_frees, 0);
}

#[test]
fn test_retire_completed_is_idempotent() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    let buffer = storage_buffer(&device, "retire");

    let frame = device.begin_frame().unwrap();
    let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
    let mut session = recorder.begin(frame).unwrap();
    session.fill_buffer(buffer, 0, 256, 1).unwrap();
    let stream = session.end().unwrap();
    let fence = device.submit_frame(frame, vec![stream]).unwrap();
    device.destroy(buffer).unwrap();
    assert!(fence.wait(Duration::from_secs(5)).unwrap());

    let first = device.retire_completed().unwrap();
    assert_eq!(first.resources_reclaimed, 1);
    let stats = device.stats();

    let second = device.retire_completed().unwrap();
    assert_eq!(second.completed, first.completed);
    assert_eq!(second.resources_reclaimed, 0);
    assert_eq!(second.memory_blocks_reclaimed, 0);
    assert_eq!(second.bytes_reclaimed, 0);
    assert_eq!(device.stats(), stats);
}

fn fill_stream(device: &Device, frame: FrameIndex, worker: u64, queue: QueueKind, buffer: BufferHandle) -> CommandStream {
    let mut recorder = device.acquire_recorder(frame, WorkerId(worker), queue).unwrap();
    let mut session = recorder.begin(frame).unwrap();
    session.fill_buffer(buffer, 0, 256, worker as u32).unwrap();
    session.end().unwrap()
}

#[test]
fn test_encode_failure_queues_nothing() {
    let (device, backend) = Device::headless(RhiConfig::default()).unwrap();
    let graphics = storage_buffer(&device, "graphics");
    let compute = storage_buffer(&device, "compute");
    let frame = device.begin_frame().unwrap();

    // 第二个 segment 编码失败
    backend.fail_encoding_on(Some(QueueKind::Compute));
    let streams = vec![
        fill_stream(&device, frame, 1, QueueKind::Graphics, graphics),
        fill_stream(&device, frame, 2, QueueKind::Compute, compute),
    ];
    assert!(matches!(device.submit_frame(frame, streams), Err(RhiError::Backend(_))));
    assert!(!device.is_lost());
    device.wait_idle().unwrap();
    assert!(backend.executed_batches().is_empty());
    assert_eq!(device.stats().in_flight, 0);

    // 这一帧仍然打开，可以重新录制并提交
    backend.fail_encoding_on(None);
    let streams = vec![
        fill_stream(&device, frame, 3, QueueKind::Graphics, graphics),
        fill_stream(&device, frame, 4, QueueKind::Compute, compute),
    ];
    device.submit_frame(frame, streams).unwrap();
    device.destroy(graphics).unwrap();

    let report = device.wait_idle().unwrap();
    assert_eq!(report.completed, Some(frame));
    assert_eq!(report.resources_reclaimed, 1);
    assert_eq!(backend.executed_batches().len(), 2);
}

#[test]
fn test_device_lost_fails_every_call() {
    let (device, backend) = Device::headless(RhiConfig::default()).unwrap();
    let buffer = storage_buffer(&device, "lost");

    let frame = device.begin_frame().unwrap();
    backend.lose_device();
    let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
    let mut session = recorder.begin(frame).unwrap();
    session.fill_buffer(buffer, 0, 256, 1).unwrap();
    let stream = session.end().unwrap();

    assert_eq!(device.submit_frame(frame, vec![stream]).unwrap_err(), RhiError::DeviceLost);
    assert!(device.is_lost());
    assert_eq!(device.begin_frame().unwrap_err(), RhiError::DeviceLost);
    assert_eq!(device.retire_completed().unwrap_err(), RhiError::DeviceLost);
    assert!(device.create_buffer(BufferDesc::new(16, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "x")).is_err());
}
