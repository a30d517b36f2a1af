use std::time::Duration;

use truvis_rhi::backend::headless::HeadlessConfig;
use truvis_rhi::resource::desc::{BufferDesc, BufferUsage, Format, ImageDesc, ImageUsage, MemoryLocality};
use truvis_rhi::{BufferHandle, Device, Handle, QueueKind, RhiConfig, RhiError, WorkerId};

fn readback(device: &Device, size: u64) -> BufferHandle {
    device
        .create_buffer(BufferDesc::new(size, BufferUsage::TRANSFER_DST, MemoryLocality::HostVisible, "readback"))
        .unwrap()
}

#[test]
fn test_stale_handles_are_rejected() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    let desc = BufferDesc::new(64, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "first");
    let first = device.create_buffer(desc.clone()).unwrap();
    assert_eq!(device.label_of(first).unwrap(), "first");

    device.destroy(first).unwrap();
    assert!(matches!(device.label_of(first), Err(RhiError::StaleHandle { .. })));
    // 重复销毁同样是 stale
    assert!(matches!(device.destroy(first), Err(RhiError::StaleHandle { .. })));

    // slot 被复用之后旧句柄依然无效
    device.retire_completed().unwrap();
    let second = device.create_buffer(BufferDesc { label: "second".into(), ..desc }).unwrap();
    if second.index() == first.index() {
        assert_ne!(second.generation(), first.generation());
    }
    assert!(matches!(device.label_of(first), Err(RhiError::StaleHandle { .. })));
    assert_eq!(device.label_of(second).unwrap(), "second");

    // 从来没有发出过的 slot
    let forged: BufferHandle = Handle::from_raw_parts(10_000, 1);
    assert!(matches!(device.label_of(forged), Err(RhiError::InvalidHandle { index: 10_000 })));
}

#[test]
fn test_staged_upload_round_trips_through_readback() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();

    let values: Vec<u32> = (0..256u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&values);
    let size = bytes.len() as u64;
    let gpu_buffer = device
        .create_buffer(BufferDesc::new(
            size,
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
            MemoryLocality::DeviceLocal,
            "gpu",
        ))
        .unwrap();
    let buffer_readback = readback(&device, size);

    let texels: Vec<u8> = (0..4 * 4 * 4).map(|i| (i * 17 % 251) as u8).collect();
    let image = device
        .create_image(ImageDesc::new_2d(
            4,
            4,
            Format::Rgba8Unorm,
            ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
            "texture",
        ))
        .unwrap();
    let image_readback = readback(&device, texels.len() as u64);

    let frame = device.begin_frame().unwrap();
    let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
    let mut session = recorder.begin(frame).unwrap();
    session.upload_buffer(gpu_buffer, 0, bytes).unwrap();
    session.copy_buffer(gpu_buffer, 0, buffer_readback, 0, size).unwrap();
    session.upload_image(image, &texels).unwrap();
    session.copy_image_to_buffer(image, image_readback, 0).unwrap();
    let stream = session.end().unwrap();
    let fence = device.submit_frame(frame, vec![stream]).unwrap();
    assert!(fence.wait(Duration::from_secs(5)).unwrap());

    let read = device.read_buffer(buffer_readback, 0..size).unwrap();
    assert_eq!(read, bytes);
    assert_eq!(device.read_buffer(image_readback, 0..texels.len() as u64).unwrap(), texels);
}

#[test]
fn test_device_local_buffer_is_not_host_readable() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    let buffer = device
        .create_buffer(BufferDesc::new(64, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "gpu"))
        .unwrap();
    assert_eq!(device.read_buffer(buffer, 0..64).unwrap_err(), RhiError::NotHostVisible);
    assert_eq!(device.write_buffer(buffer, 0, &[0; 4]).unwrap_err(), RhiError::NotHostVisible);
}

#[test]
fn test_out_of_device_memory_leaves_state_unchanged() {
    let headless = HeadlessConfig {
        device_local_budget: 4 << 20,
        ..Default::default()
    };
    let mut config = RhiConfig::default();
    config.allocator.device_local_block_size = 1 << 20;
    let (device, _) = Device::headless_with(config, headless).unwrap();
    let before = device.stats();

    let huge = BufferDesc::new(64 << 20, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "huge");
    assert!(matches!(device.create_buffer(huge), Err(RhiError::OutOfDeviceMemory { .. })));
    assert_eq!(device.stats().live_resources, before.live_resources);

    // 失败之后正常大小的分配不受影响
    device
        .create_buffer(BufferDesc::new(1024, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "small"))
        .unwrap();
}

#[test]
fn test_oversized_buffer_reports_out_of_memory() {
    let (device, _) = Device::headless(RhiConfig::default()).unwrap();
    for locality in [MemoryLocality::DeviceLocal, MemoryLocality::HostVisible] {
        // 向上取整到 2 的幂会超出 u64
        let desc = BufferDesc::new(u64::MAX / 2 + 2, BufferUsage::STORAGE, locality, "oversized");
        assert!(matches!(device.create_buffer(desc), Err(RhiError::OutOfDeviceMemory { .. })));
    }
    let desc = BufferDesc::new(u64::MAX, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "max");
    assert!(matches!(device.create_buffer(desc), Err(RhiError::OutOfDeviceMemory { .. })));
    assert_eq!(device.stats().live_resources, 0);
}

#[test]
fn test_table_capacity_is_enforced() {
    let (device, _) = Device::headless(RhiConfig::default().with_table_capacity(2)).unwrap();
    let desc = BufferDesc::new(16, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "buffer");
    let a = device.create_buffer(desc.clone()).unwrap();
    device.create_buffer(desc.clone()).unwrap();
    assert_eq!(
        device.create_buffer(desc.clone()).unwrap_err(),
        RhiError::OutOfTableSpace { capacity: 2 }
    );

    // 回收之后 slot 可以复用
    device.destroy(a).unwrap();
    device.retire_completed().unwrap();
    device.create_buffer(desc).unwrap();
}
