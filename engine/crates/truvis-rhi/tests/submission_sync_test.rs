use std::thread;

use truvis_rhi::resource::desc::{BufferDesc, BufferUsage, MemoryLocality};
use truvis_rhi::sync::{HazardKind, SyncEdge};
use truvis_rhi::{
    AccessKind, BufferHandle, CommandStream, Device, FrameIndex, PipelineStages, QueueKind, RhiConfig, RhiError,
    SyncGranularity, WorkerId,
};

fn buffer(device: &Device, label: &str) -> BufferHandle {
    device
        .create_buffer(BufferDesc::new(
            256,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            MemoryLocality::DeviceLocal,
            label,
        ))
        .unwrap()
}

fn record(
    device: &Device,
    frame: FrameIndex,
    worker: u64,
    f: impl FnOnce(&mut truvis_rhi::RecordingSession<'_>) -> Result<(), RhiError>,
) -> CommandStream {
    let mut recorder = device.acquire_recorder(frame, WorkerId(worker), QueueKind::Graphics).unwrap();
    let mut session = recorder.begin(frame).unwrap();
    f(&mut session).unwrap();
    session.end().unwrap()
}

fn edges_of(device: &Device, buffer: BufferHandle) -> Vec<SyncEdge> {
    let report = device.last_submission().unwrap();
    report.edges.into_iter().filter(|e| e.resource == buffer.raw()).collect()
}

#[test]
fn test_conflicting_streams_get_barrier_and_readers_do_not() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    let written = buffer(&device, "written");
    let shared = buffer(&device, "shared");

    // shared 在上一帧中被写入
    let frame = device.begin_frame().unwrap();
    let init = record(&device, frame, 1, |s| s.fill_buffer(shared, 0, 256, 3));
    device.submit_frame(frame, vec![init]).unwrap();

    let frame = device.begin_frame().unwrap();
    let streams = vec![
        record(&device, frame, 1, |s| s.fill_buffer(written, 0, 256, 1)),
        record(&device, frame, 2, |s| {
            s.bind_resource(written, Some(AccessKind::Read), PipelineStages::COMPUTE_SHADER)
        }),
        record(&device, frame, 3, |s| {
            s.bind_resource(shared, Some(AccessKind::Read), PipelineStages::COMPUTE_SHADER)
        }),
        record(&device, frame, 4, |s| {
            s.bind_resource(shared, Some(AccessKind::Read), PipelineStages::FRAGMENT_SHADER)
        }),
    ];
    device.submit_frame(frame, streams).unwrap();

    let written_edges = edges_of(&device, written);
    assert_eq!(written_edges.len(), 1);
    assert_eq!(written_edges[0].producer, Some(0));
    assert_eq!(written_edges[0].consumer, 1);
    assert_eq!(written_edges[0].hazard, HazardKind::ReadAfterWrite);

    // 只有第一个读取需要等待上一帧的写入，两个读取之间没有 barrier
    let shared_edges = edges_of(&device, shared);
    assert_eq!(shared_edges.len(), 1);
    assert_eq!(shared_edges[0].producer, None);
    assert_eq!(shared_edges[0].consumer, 2);
}

#[test]
fn test_write_after_read_between_streams() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    let target = buffer(&device, "target");

    let frame = device.begin_frame().unwrap();
    let streams = vec![
        record(&device, frame, 1, |s| {
            s.bind_resource(target, Some(AccessKind::Read), PipelineStages::VERTEX_SHADER)
        }),
        record(&device, frame, 2, |s| s.fill_buffer(target, 0, 256, 0)),
    ];
    device.submit_frame(frame, streams).unwrap();

    let edges = edges_of(&device, target);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].hazard, HazardKind::WriteAfterRead);
    assert_eq!(edges[0].producer, Some(0));
}

#[test]
fn test_undeclared_access_kind_is_read_write() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    let target = buffer(&device, "target");

    let frame = device.begin_frame().unwrap();
    let streams = vec![
        record(&device, frame, 1, |s| s.bind_resource(target, None, PipelineStages::COMPUTE_SHADER)),
        record(&device, frame, 2, |s| s.bind_resource(target, None, PipelineStages::COMPUTE_SHADER)),
    ];
    device.submit_frame(frame, streams).unwrap();
    assert_eq!(edges_of(&device, target).len(), 1);
}

fn partial_overlap_edges(granularity: SyncGranularity, read_offset: u64) -> usize {
    let (device, _) = Device::headless(RhiConfig::default().with_granularity(granularity)).unwrap();
    let src = buffer(&device, "src");
    let dst = buffer(&device, "dst");

    let frame = device.begin_frame().unwrap();
    let streams = vec![
        record(&device, frame, 1, |s| s.fill_buffer(src, 0, 128, 7)),
        record(&device, frame, 2, |s| s.copy_buffer(src, read_offset, dst, 0, 128)),
    ];
    device.submit_frame(frame, streams).unwrap();
    edges_of(&device, src).len()
}

#[test]
fn test_byte_range_granularity() {
    // 写入 [0, 128)，读取同一段总是需要 barrier
    assert_eq!(partial_overlap_edges(SyncGranularity::WholeResource, 0), 1);
    assert_eq!(partial_overlap_edges(SyncGranularity::ByteRange, 0), 1);

    // 读取 [128, 256)：只有按字节范围追踪时才能省掉 barrier
    assert_eq!(partial_overlap_edges(SyncGranularity::WholeResource, 128), 1);
    assert_eq!(partial_overlap_edges(SyncGranularity::ByteRange, 128), 0);
}

#[test]
fn test_byte_range_readers_of_disjoint_halves_each_get_barrier() {
    let (device, _) = Device::headless(RhiConfig::default().with_granularity(SyncGranularity::ByteRange)).unwrap();
    let src = buffer(&device, "src");
    let low = buffer(&device, "low");
    let high = buffer(&device, "high");

    let frame = device.begin_frame().unwrap();
    let streams = vec![
        record(&device, frame, 1, |s| s.fill_buffer(src, 0, 128, 7)),
        record(&device, frame, 2, |s| s.copy_buffer(src, 0, low, 0, 64)),
        record(&device, frame, 3, |s| s.copy_buffer(src, 64, high, 0, 64)),
    ];
    device.submit_frame(frame, streams).unwrap();

    // 两个读取都依赖 stream 0 的写入，第一个 barrier 只覆盖 [0, 64)
    let edges: Vec<_> = edges_of(&device, src).into_iter().map(|e| (e.consumer, e.hazard)).collect();
    assert_eq!(edges, vec![(1, HazardKind::ReadAfterWrite), (2, HazardKind::ReadAfterWrite)]);
}

#[test]
fn test_streams_recorded_on_worker_threads() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    let buffers: Vec<_> = (0..4).map(|i| buffer(&device, &format!("worker-{i}"))).collect();
    let frame = device.begin_frame().unwrap();

    let (sender, receiver) = crossbeam_channel::unbounded();
    let workers: Vec<_> = buffers
        .iter()
        .enumerate()
        .map(|(i, &target)| {
            let device = device.clone();
            let sender = sender.clone();
            thread::spawn(move || {
                let worker = WorkerId::current();
                let mut recorder = device.acquire_recorder(frame, worker, QueueKind::Graphics).unwrap();
                // 同一个 worker 在同一帧只能获取一次
                assert!(matches!(
                    device.acquire_recorder(frame, worker, QueueKind::Graphics),
                    Err(RhiError::RecorderAlreadyAcquired { .. })
                ));
                let mut session = recorder.begin(frame).unwrap();
                session.fill_buffer(target, 0, 256, i as u32).unwrap();
                sender.send((i, session.end().unwrap())).unwrap();
            })
        })
        .collect();
    drop(sender);
    for worker in workers {
        worker.join().unwrap();
    }

    // 提交顺序由调用者决定，与录制完成的顺序无关
    let mut streams: Vec<_> = receiver.iter().collect();
    streams.sort_by_key(|(i, _)| *i);
    let streams: Vec<_> = streams.into_iter().map(|(_, s)| s).collect();
    device.submit_frame(frame, streams).unwrap();

    let report = device.last_submission().unwrap();
    assert_eq!(report.segments.len(), 1);
    assert_eq!(report.segments[0].streams, 0..4);
    assert_eq!(report.barrier_count, 0);
}
