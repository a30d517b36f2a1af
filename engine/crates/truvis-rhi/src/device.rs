//! Device：RHI 的入口
//!
//! 持有后端、所有 queue、资源表、内存分配器、帧管理和提交调度，是它们唯一的所有者。
//!
//! 锁的顺序固定为：scheduler -> frames -> table -> allocator，任何地方都不能反过来获取。

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::allocator::{AllocatorStats, ResourceAllocator};
use crate::backend::headless::{HeadlessBackend, HeadlessConfig};
use crate::backend::{BackendInfo, GfxBackend, ObjectDesc, ObjectId, ResolvedDescriptor};
use crate::commands::staging::{StagingChunk, StagingRegion};
use crate::commands::stream::CommandPool;
use crate::commands::{CommandRecorder, CommandStream, WorkerId};
use crate::config::RhiConfig;
use crate::error::{RhiError, RhiResult};
use crate::frame::{Fence, FrameIndex, FrameManager, FrameStats, FrameTimer, RetireReport};
use crate::queue::{Queue, QueueKind};
use crate::resource::desc::{
    BufferDesc, BufferUsage, DescriptorResource, DescriptorSetDesc, ImageDesc, ImageUsage, MemoryLocality,
    PipelineDesc, SamplerDesc,
};
use crate::resource::handles::{
    Buffer, BufferHandle, DescriptorSet, DescriptorSetHandle, Handle, Image, ImageHandle, Pipeline, PipelineHandle,
    ResourceKind, Sampler, SamplerHandle,
};
use crate::resource::{Resource, ResourceData, ResourceTable};
use crate::scheduler::{SubmissionReport, SubmissionScheduler};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceStats {
    /// 没有被销毁的资源
    pub live_resources: usize,
    /// 已经销毁、等待回收的资源
    pub pending_destroy: usize,
    pub allocator: AllocatorStats,
    pub frames: FrameStats,
    pub in_flight: usize,
    pub completed_frame: Option<FrameIndex>,
    pub last_submitted: Option<FrameIndex>,
}

/// Device 内部共享的状态，recorder 也持有一份
pub(crate) struct DeviceShared {
    pub(crate) backend: Arc<dyn GfxBackend>,
    pub(crate) info: BackendInfo,
    pub(crate) config: RhiConfig,
    lost: AtomicBool,

    pub(crate) scheduler: Mutex<SubmissionScheduler>,
    pub(crate) frames: Mutex<FrameManager>,
    pub(crate) table: RwLock<ResourceTable>,
    pub(crate) allocator: Mutex<ResourceAllocator>,

    /// 当前帧已经发出的 recorder
    recorders: Mutex<HashSet<(FrameIndex, WorkerId)>>,
    timer: Mutex<FrameTimer>,
}
// device lost
impl DeviceShared {
    #[inline]
    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn check_alive(&self) -> RhiResult<()> {
        if self.is_lost() { Err(RhiError::DeviceLost) } else { Ok(()) }
    }

    /// 观察后端返回的结果，`DeviceLost` 会让 Device 永久失效
    pub(crate) fn observe<T>(&self, result: RhiResult<T>) -> RhiResult<T> {
        if let Err(RhiError::DeviceLost) = &result {
            if !self.lost.swap(true, Ordering::AcqRel) {
                log::error!("device lost, every following call will fail");
            }
        }
        result
    }
}
// resource creation
impl DeviceShared {
    /// 分配内存、创建后端对象并登记到资源表，任何一步失败都会回滚之前的步骤
    fn create_with_memory<T: ResourceKind>(
        &self,
        data: ResourceData,
        linear: bool,
        locality: MemoryLocality,
    ) -> RhiResult<Handle<T>> {
        let desc = match &data {
            ResourceData::Buffer(desc) => ObjectDesc::Buffer(desc),
            ResourceData::Image(desc) => ObjectDesc::Image(desc),
            _ => unreachable!("only buffers and images are backed by memory"),
        };
        let requirements = self.observe(self.backend.memory_requirements(desc))?;
        let block = self
            .allocator
            .lock()
            .allocate(requirements.size, requirements.alignment, linear, locality)?;
        let object = match self.observe(self.backend.create_object(desc, Some(block.binding()))) {
            Ok(object) => object,
            Err(e) => {
                self.allocator.lock().free(block, None);
                return Err(e);
            }
        };

        let mut table = self.table.write();
        match table.insert::<T>(Resource::new(data, object, Some(block))) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.backend.destroy_object(object);
                self.allocator.lock().free(block, None);
                Err(e)
            }
        }
    }

    fn create_without_memory<T: ResourceKind>(&self, data: ResourceData, object: ObjectId) -> RhiResult<Handle<T>> {
        let mut table = self.table.write();
        match table.insert::<T>(Resource::new(data, object, None)) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.backend.destroy_object(object);
                Err(e)
            }
        }
    }

    pub(crate) fn create_buffer(&self, desc: BufferDesc) -> RhiResult<BufferHandle> {
        self.check_alive()?;
        desc.validate()?;
        let locality = desc.locality;
        let handle = self.create_with_memory::<Buffer>(ResourceData::Buffer(desc), true, locality)?;
        log::trace!("create buffer {:?}", handle);
        Ok(handle)
    }

    fn resolve_descriptors(&self, table: &ResourceTable, desc: &DescriptorSetDesc) -> RhiResult<Vec<ResolvedDescriptor>> {
        let label = &desc.label;
        let check_buffer = |buffer: BufferHandle, usage: BufferUsage| -> RhiResult<ObjectId> {
            let (resource, buffer_desc) = table.buffer(buffer)?;
            if !buffer_desc.usage.contains(usage) {
                return Err(RhiError::invalid_descriptor(
                    label,
                    format!("buffer '{}' lacks usage {usage:?}", buffer_desc.label),
                ));
            }
            Ok(resource.object)
        };
        let check_image = |image: ImageHandle, usage: ImageUsage| -> RhiResult<ObjectId> {
            let (resource, image_desc) = table.image(image)?;
            if !image_desc.usage.contains(usage) {
                return Err(RhiError::invalid_descriptor(
                    label,
                    format!("image '{}' lacks usage {usage:?}", image_desc.label),
                ));
            }
            Ok(resource.object)
        };

        desc.bindings
            .iter()
            .map(|binding| {
                let (object, sampler) = match binding.resource {
                    DescriptorResource::UniformBuffer(buffer) => (check_buffer(buffer, BufferUsage::UNIFORM)?, None),
                    DescriptorResource::StorageBuffer { buffer, .. } => {
                        (check_buffer(buffer, BufferUsage::STORAGE)?, None)
                    }
                    DescriptorResource::SampledImage { image, sampler } => {
                        (check_image(image, ImageUsage::SAMPLED)?, Some(table.resolve(sampler)?.object))
                    }
                    DescriptorResource::StorageImage { image, .. } => (check_image(image, ImageUsage::STORAGE)?, None),
                };
                Ok(ResolvedDescriptor {
                    binding: binding.binding,
                    ty: binding.resource.ty(),
                    object,
                    sampler,
                })
            })
            .collect()
    }

    pub(crate) fn create_descriptor_set(&self, desc: DescriptorSetDesc) -> RhiResult<DescriptorSetHandle> {
        self.check_alive()?;
        desc.validate()?;
        let resolved = self.resolve_descriptors(&self.table.read(), &desc)?;
        let object = self.observe(self.backend.create_object(ObjectDesc::DescriptorSet(&resolved), None))?;
        self.create_without_memory::<DescriptorSet>(ResourceData::DescriptorSet(desc), object)
    }
}
// staging
impl DeviceShared {
    /// 把数据写入 frame 的 staging belt，返回写入的位置
    ///
    /// 放不下时创建新的 chunk，chunk 在槽位的 fence 完成之后复用。
    pub(crate) fn stage_bytes(&self, frame: FrameIndex, data: &[u8]) -> RhiResult<StagingRegion> {
        let _span = crate::rhi_span!("DeviceShared::stage_bytes");
        let size = data.len() as u64;
        let mut frames = self.frames.lock();
        let belt = frames.staging_mut(frame)?;

        let region = match belt.try_allocate(size) {
            Some(region) => region,
            None => {
                let chunk_size = belt.chunk_size_for(size);
                let label = format!("staging-{}-{}", frame.slot(self.config.frames.frames_in_flight), belt.chunk_count());
                let desc = BufferDesc::new(chunk_size, BufferUsage::TRANSFER_SRC, MemoryLocality::HostVisible, label);
                let buffer = self.create_buffer(desc)?;
                let memory = self
                    .table
                    .read()
                    .resolve(buffer)?
                    .memory
                    .ok_or_else(|| RhiError::Backend("staging buffer without memory".to_string()))?;
                belt.add_chunk(StagingChunk::new(buffer, memory, chunk_size));
                belt.try_allocate(size)
                    .ok_or(RhiError::InvalidRange { offset: 0, size, len: chunk_size })?
            }
        };

        let memory = region.memory;
        self.observe(self.backend.write_memory(memory.memory, memory.offset + region.offset, data))?;
        Ok(region)
    }

    /// recorder 没有提交就被丢弃时归还 pool
    pub(crate) fn release_pool(&self, frame: FrameIndex, pool: CommandPool) {
        self.frames.lock().return_pool(frame, pool, false);
    }
}
// retire
impl DeviceShared {
    fn retire_locked(&self, frames: &mut FrameManager) -> RetireReport {
        let _span = crate::rhi_span!("Device::retire_completed");
        let completed = frames.poll_completed();

        let retired = self.table.write().collect_retired(completed);
        for (handle, resource) in &retired {
            log::trace!("reclaim {} ({})", handle, resource.label());
            if !resource.external {
                self.backend.destroy_object(resource.object);
            }
        }
        let reclaim = self.allocator.lock().reclaim(completed);

        RetireReport {
            completed,
            resources_reclaimed: retired.len(),
            memory_blocks_reclaimed: reclaim.blocks,
            bytes_reclaimed: reclaim.bytes,
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        if !self.is_lost() {
            if let Err(e) = self.backend.wait_idle() {
                log::error!("wait idle on device destroy failed: {}", e);
            }
        }

        let resources = self.table.get_mut().drain_all();
        let count = resources.len();
        for (_, resource) in resources {
            if !resource.external {
                self.backend.destroy_object(resource.object);
            }
        }
        self.allocator.get_mut().destroy();
        log::info!("device destroyed, {} resources released", count);
    }
}

/// 与后端无关的 GPU 设备
///
/// 可以在多个线程之间共享，录制线程通过 `acquire_recorder` 获取各自的 recorder。
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}
// new & init
impl Device {
    pub fn new(backend: Arc<dyn GfxBackend>, config: RhiConfig) -> RhiResult<Self> {
        config.validate()?;
        let info = backend.info().clone();
        if info.queues.is_empty() {
            return Err(RhiError::Backend(format!("backend '{}' provides no queue", info.name)));
        }

        let mut queues = Vec::with_capacity(info.queues.len());
        for &kind in &info.queues {
            let queue = backend.queue(kind).ok_or(RhiError::QueueUnavailable(kind))?;
            queues.push(Queue::new(kind, queue));
        }
        let scheduler = SubmissionScheduler::new(queues, info.primary_queue());

        log::info!(
            "device created on '{}': queues {:?}, {} frames in flight, {:?} sync",
            info.name,
            info.queues,
            config.frames.frames_in_flight,
            config.sync.granularity
        );
        let shared = DeviceShared {
            frames: Mutex::new(FrameManager::new(&config)),
            table: RwLock::new(ResourceTable::new(config.resources.table_capacity)),
            allocator: Mutex::new(ResourceAllocator::new(backend.clone(), config.allocator.clone())),
            scheduler: Mutex::new(scheduler),
            recorders: Mutex::new(HashSet::new()),
            timer: Mutex::new(FrameTimer::default()),
            lost: AtomicBool::new(false),
            backend,
            info,
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// 使用 CPU 模拟的后端创建 Device，同时返回后端以便控制模拟的 GPU
    pub fn headless(config: RhiConfig) -> RhiResult<(Self, Arc<HeadlessBackend>)> {
        Self::headless_with(config, HeadlessConfig::default())
    }

    pub fn headless_with(config: RhiConfig, headless: HeadlessConfig) -> RhiResult<(Self, Arc<HeadlessBackend>)> {
        let backend = Arc::new(HeadlessBackend::new(headless));
        let device = Self::new(backend.clone(), config)?;
        Ok((device, backend))
    }
}
// getters
impl Device {
    #[inline]
    pub fn config(&self) -> &RhiConfig {
        &self.shared.config
    }

    #[inline]
    pub fn backend_info(&self) -> &BackendInfo {
        &self.shared.info
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn GfxBackend> {
        &self.shared.backend
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// 当前正在录制的帧
    #[inline]
    pub fn current_frame(&self) -> Option<FrameIndex> {
        self.shared.frames.lock().open_frame()
    }

    pub fn stats(&self) -> DeviceStats {
        let frames = self.shared.frames.lock();
        let table = self.shared.table.read();
        let allocator = self.shared.allocator.lock();
        DeviceStats {
            live_resources: table.live_count(),
            pending_destroy: table.pending_count(),
            allocator: allocator.stats(),
            frames: frames.stats(),
            in_flight: frames.in_flight(),
            completed_frame: frames.completed(),
            last_submitted: frames.last_submitted(),
        }
    }

    /// 最近一次 `submit_frame` 的详细信息
    pub fn last_submission(&self) -> Option<SubmissionReport> {
        self.shared.scheduler.lock().last_submission().cloned()
    }

    #[inline]
    pub fn frame_name(&self, frame: FrameIndex) -> String {
        self.shared.frames.lock().frame_name(frame)
    }

    /// 帧计时，begin_frame 时更新
    pub fn frame_timer<R>(&self, f: impl FnOnce(&FrameTimer) -> R) -> R {
        f(&self.shared.timer.lock())
    }

    /// 资源的调试名称
    pub fn label_of<T: ResourceKind>(&self, handle: Handle<T>) -> RhiResult<String> {
        Ok(self.shared.table.read().resolve(handle)?.label().to_string())
    }
}
// resource creation
impl Device {
    pub fn create_buffer(&self, desc: BufferDesc) -> RhiResult<BufferHandle> {
        self.shared.create_buffer(desc)
    }

    pub fn create_image(&self, desc: ImageDesc) -> RhiResult<ImageHandle> {
        self.shared.check_alive()?;
        desc.validate()?;
        let handle =
            self.shared
                .create_with_memory::<Image>(ResourceData::Image(desc), false, MemoryLocality::DeviceLocal)?;
        log::trace!("create image {:?}", handle);
        Ok(handle)
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> RhiResult<SamplerHandle> {
        self.shared.check_alive()?;
        desc.validate()?;
        let object = self.shared.observe(self.shared.backend.create_object(ObjectDesc::Sampler(&desc), None))?;
        self.shared.create_without_memory::<Sampler>(ResourceData::Sampler(desc), object)
    }

    pub fn create_pipeline(&self, desc: PipelineDesc) -> RhiResult<PipelineHandle> {
        self.shared.check_alive()?;
        desc.validate()?;
        let object = self.shared.observe(self.shared.backend.create_object(ObjectDesc::Pipeline(&desc), None))?;
        self.shared.create_without_memory::<Pipeline>(ResourceData::Pipeline(desc), object)
    }

    /// 引用的资源必须存活并且带有对应的 usage
    pub fn create_descriptor_set(&self, desc: DescriptorSetDesc) -> RhiResult<DescriptorSetHandle> {
        self.shared.create_descriptor_set(desc)
    }

    /// 只在 frame 中使用的 descriptor set，frame 提交时自动销毁
    pub fn create_transient_descriptor_set(
        &self,
        frame: FrameIndex,
        desc: DescriptorSetDesc,
    ) -> RhiResult<DescriptorSetHandle> {
        self.shared.frames.lock().ensure_open(frame)?;
        let handle = self.shared.create_descriptor_set(desc)?;
        if let Err(e) = self.shared.frames.lock().add_transient(frame, handle.raw()) {
            // frame 在创建期间被提交了
            self.destroy(handle)?;
            return Err(e);
        }
        Ok(handle)
    }

    /// 由 surface 持有的 image，只登记到资源表中
    pub(crate) fn register_external_image(&self, desc: ImageDesc, object: ObjectId) -> RhiResult<ImageHandle> {
        let mut table = self.shared.table.write();
        table.insert::<Image>(Resource::new(ResourceData::Image(desc), object, None).external())
    }

    /// 销毁资源
    ///
    /// 句柄立即失效，后端对象和内存在引用它的最后一帧完成之后才会回收。
    pub fn destroy<T: ResourceKind>(&self, handle: Handle<T>) -> RhiResult<()> {
        self.shared.check_alive()?;
        let frames = self.shared.frames.lock();
        let mut table = self.shared.table.write();
        table.destroy(handle.raw(), frames.open_frame())?;

        let resource = table.resolve_for_submit(handle.raw())?;
        if let Some(block) = resource.memory {
            self.shared.allocator.lock().free(block, resource.last_used);
        }
        Ok(())
    }
}
// host access
impl Device {
    /// 直接写入 host visible 的 buffer
    ///
    /// 调用者需要保证 GPU 没有在同时访问这段内存。
    pub fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.shared.check_alive()?;
        let table = self.shared.table.read();
        let (resource, desc) = table.buffer(buffer)?;
        if desc.locality != MemoryLocality::HostVisible {
            return Err(RhiError::NotHostVisible);
        }
        RhiError::check_range(offset, data.len() as u64, desc.size)?;
        let block = resource
            .memory
            .ok_or_else(|| RhiError::Backend(format!("buffer '{}' has no memory", desc.label)))?;
        self.shared
            .observe(self.shared.backend.write_memory(block.memory, block.offset + offset, data))
    }

    /// 读取 host visible 的 buffer，通常在 fence 完成之后用于 readback
    pub fn read_buffer(&self, buffer: BufferHandle, range: Range<u64>) -> RhiResult<Vec<u8>> {
        self.shared.check_alive()?;
        let table = self.shared.table.read();
        let (resource, desc) = table.buffer(buffer)?;
        if desc.locality != MemoryLocality::HostVisible {
            return Err(RhiError::NotHostVisible);
        }
        let size = range.end.saturating_sub(range.start);
        RhiError::check_range(range.start, size, desc.size)?;
        let block = resource
            .memory
            .ok_or_else(|| RhiError::Backend(format!("buffer '{}' has no memory", desc.label)))?;

        let mut out = vec![0u8; size as usize];
        self.shared
            .observe(self.shared.backend.read_memory(block.memory, block.offset + range.start, &mut out))?;
        Ok(out)
    }
}
// frame
impl Device {
    /// 开始新的一帧
    ///
    /// 等待 N 帧之前的 fence（最多 `fence_timeout`），回收已经完成的资源，然后打开新的一帧。
    pub fn begin_frame(&self) -> RhiResult<FrameIndex> {
        let _span = crate::rhi_span!("Device::begin_frame");
        self.shared.check_alive()?;

        // 等待槽位的 fence 时不持有 frames 锁，醒来之后重新检查
        let mut stall = Duration::ZERO;
        let (mut frames, frame) = loop {
            let frames = self.shared.frames.lock();
            let (frame, fence) = frames.next_slot()?;
            let Some(fence) = fence else {
                break (frames, frame);
            };
            let timeout = frames.fence_timeout();
            drop(frames);

            log::debug!("{} waits for {} to complete", frame, fence.frame());
            let start = Instant::now();
            let signaled = self.shared.observe(fence.wait(timeout))?;
            let waited = start.elapsed();
            stall += waited;
            self.shared.frames.lock().record_slot_wait(&fence, waited, signaled)?;
        };

        let report = self.shared.retire_locked(&mut frames);
        if !report.is_empty() {
            log::debug!(
                "retired up to {:?}: {} resources, {} bytes",
                report.completed,
                report.resources_reclaimed,
                report.bytes_reclaimed
            );
        }
        self.shared.observe(frames.begin(frame, self.shared.backend.as_ref()))?;
        self.shared.recorders.lock().retain(|(f, _)| *f == frame);

        let mut timer = self.shared.timer.lock();
        timer.tick();
        timer.record_stall(stall);
        Ok(frame)
    }

    /// 为 worker 获取 frame 的 recorder，每个 (frame, worker) 只能获取一次
    pub fn acquire_recorder(&self, frame: FrameIndex, worker: WorkerId, queue: QueueKind) -> RhiResult<CommandRecorder> {
        self.shared.check_alive()?;
        if !self.shared.info.has_queue(queue) {
            return Err(RhiError::QueueUnavailable(queue));
        }

        let mut frames = self.shared.frames.lock();
        frames.ensure_open(frame)?;
        if !self.shared.recorders.lock().insert((frame, worker)) {
            return Err(RhiError::RecorderAlreadyAcquired { frame, worker });
        }
        let pool = frames.take_pool(frame, queue)?;
        let label = format!("{}-{}-{}", frames.frame_name(frame), queue, worker);
        Ok(CommandRecorder::new(self.shared.clone(), frame, worker, queue, pool, label))
    }

    /// 按给定的顺序提交 frame 的所有 stream，返回这一帧的 fence
    pub fn submit_frame(&self, frame: FrameIndex, streams: Vec<CommandStream>) -> RhiResult<Fence> {
        let _span = crate::rhi_span!("Device::submit_frame");
        self.shared.check_alive()?;
        let mut scheduler = self.shared.scheduler.lock();
        let mut frames = self.shared.frames.lock();

        let fence = self.shared.observe(scheduler.submit_frame(&self.shared, &mut frames, frame, streams))?;
        self.shared.recorders.lock().retain(|(f, _)| *f != frame);
        crate::profiling::frame_mark();
        Ok(fence)
    }

    /// 推进完成水位线，回收所有可以回收的资源和内存
    ///
    /// 两帧之间重复调用不会有额外的效果。
    pub fn retire_completed(&self) -> RhiResult<RetireReport> {
        self.shared.check_alive()?;
        let mut frames = self.shared.frames.lock();
        Ok(self.shared.retire_locked(&mut frames))
    }

    /// 等待所有已经提交的工作完成并回收资源
    pub fn wait_idle(&self) -> RhiResult<RetireReport> {
        let _span = crate::rhi_span!("Device::wait_idle");
        self.shared.check_alive()?;
        self.shared.observe(self.shared.backend.wait_idle())?;
        self.retire_completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::desc::{DescriptorBinding, Format, ShaderDesc};
    use crate::sync::PipelineStages;

    fn device() -> (Device, Arc<HeadlessBackend>) {
        Device::headless(RhiConfig::default()).unwrap()
    }

    fn host_buffer(device: &Device, size: u64) -> BufferHandle {
        device
            .create_buffer(BufferDesc::new(
                size,
                BufferUsage::TRANSFER_DST | BufferUsage::TRANSFER_SRC,
                MemoryLocality::HostVisible,
                "host",
            ))
            .unwrap()
    }

    #[test]
    fn test_invalid_descriptor_is_rejected() {
        let (device, _) = device();
        let zero = BufferDesc::new(0, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "zero");
        assert!(matches!(device.create_buffer(zero), Err(RhiError::InvalidDescriptor(_))));

        let image = ImageDesc::new_2d(0, 4, Format::Rgba8Unorm, ImageUsage::SAMPLED, "empty");
        assert!(matches!(device.create_image(image), Err(RhiError::InvalidDescriptor(_))));
        assert_eq!(device.stats().live_resources, 0);
    }

    #[test]
    fn test_host_write_and_read() {
        let (device, _) = device();
        let buffer = host_buffer(&device, 64);
        device.write_buffer(buffer, 8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.read_buffer(buffer, 8..12).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            device.read_buffer(buffer, 60..68).unwrap_err(),
            RhiError::InvalidRange {
                offset: 60,
                size: 8,
                len: 64
            }
        );

        let gpu_only = device
            .create_buffer(BufferDesc::new(64, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "gpu"))
            .unwrap();
        assert_eq!(device.write_buffer(gpu_only, 0, &[0]), Err(RhiError::NotHostVisible));
    }

    #[test]
    fn test_descriptor_set_checks_referenced_resources() {
        let (device, _) = device();
        let uniform = device
            .create_buffer(BufferDesc::new(64, BufferUsage::UNIFORM, MemoryLocality::HostVisible, "ubo"))
            .unwrap();
        let set = DescriptorSetDesc::new(
            vec![DescriptorBinding {
                binding: 0,
                resource: DescriptorResource::UniformBuffer(uniform),
            }],
            "set",
        );
        assert!(device.create_descriptor_set(set.clone()).is_ok());

        let wrong_usage = DescriptorSetDesc::new(
            vec![DescriptorBinding {
                binding: 0,
                resource: DescriptorResource::StorageBuffer {
                    buffer: uniform,
                    writable: false,
                },
            }],
            "wrong",
        );
        assert!(matches!(device.create_descriptor_set(wrong_usage), Err(RhiError::InvalidDescriptor(_))));

        device.destroy(uniform).unwrap();
        assert!(matches!(device.create_descriptor_set(set), Err(RhiError::StaleHandle { .. })));
    }

    #[test]
    fn test_destroy_unused_resource_is_reclaimed_on_retire() {
        let (device, backend) = device();
        let buffer = host_buffer(&device, 64);
        let objects = backend.object_count();

        device.destroy(buffer).unwrap();
        assert_eq!(device.stats().pending_destroy, 1);
        assert!(matches!(device.destroy(buffer), Err(RhiError::StaleHandle { .. })));

        let report = device.retire_completed().unwrap();
        assert_eq!(report.resources_reclaimed, 1);
        assert_eq!(backend.object_count(), objects - 1);
        assert_eq!(device.retire_completed().unwrap().resources_reclaimed, 0);
    }

    #[test]
    fn test_pipeline_and_sampler() {
        let (device, _) = device();
        let shader = ShaderDesc::new(PipelineStages::COMPUTE_SHADER, "main", vec![0; 4]);
        let pipeline = device.create_pipeline(PipelineDesc::compute(shader, "cs")).unwrap();
        assert_eq!(device.label_of(pipeline).unwrap(), "cs");

        let mut sampler = SamplerDesc::new(Default::default(), Default::default(), "bad");
        sampler.max_anisotropy = Some(32.0);
        assert!(device.create_sampler(sampler).is_err());
    }

    #[test]
    fn test_device_lost_poisons_device() {
        let (device, backend) = device();
        let frame = device.begin_frame().unwrap();
        backend.lose_device();

        assert_eq!(device.submit_frame(frame, Vec::new()).unwrap_err(), RhiError::DeviceLost);
        assert!(device.is_lost());
        assert_eq!(device.begin_frame().unwrap_err(), RhiError::DeviceLost);
        assert_eq!(device.create_buffer(BufferDesc::new(4, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "b")).unwrap_err(), RhiError::DeviceLost);
    }
}
