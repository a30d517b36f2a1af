use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ash::vk;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use raw_window_handle::RawDisplayHandle;
use truvis_rhi::backend::{
    BackendInfo, BackendQueue, BackendSurface, CommandEncoder, DeviceMemoryId, GfxBackend, MemoryBinding,
    MemoryRequirements, ObjectDesc, ObjectId,
};
use truvis_rhi::resource::desc::MemoryLocality;
use truvis_rhi::swapchain::SurfaceTarget;
use truvis_rhi::{QueueKind, RhiError, RhiResult, TimelinePoint};

use crate::VulkanConfig;
use crate::convert::vk_error;
use crate::device::VulkanDevice;
use crate::encoder::{CommandPoolSlot, VulkanEncoder};
use crate::instance::VulkanInstance;
use crate::memory::MemoryPool;
use crate::objects::VulkanObject;
use crate::physical_device::VulkanPhysicalDevice;
use crate::queue::{QueueSlot, VulkanQueue};
use crate::surface::VulkanSurface;

/// 后端、queue、encoder、surface 共享的状态
pub(crate) struct VulkanShared {
    pub(crate) instance: VulkanInstance,
    pub(crate) pdevice: VulkanPhysicalDevice,
    pub(crate) device: VulkanDevice,
    pub(crate) queues: Vec<QueueSlot>,

    pub(crate) memory: Mutex<MemoryPool>,
    pub(crate) objects: RwLock<HashMap<ObjectId, VulkanObject>>,
    /// (帧槽位, queue) -> command pool
    pub(crate) pools: Mutex<HashMap<(usize, QueueKind), CommandPoolSlot>>,

    next_object: AtomicU64,
    lost: AtomicBool,
}

// getters
impl VulkanShared {
    pub(crate) const PRESENT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

    #[inline]
    pub(crate) fn queue_slot(&self, kind: QueueKind) -> Option<&QueueSlot> {
        self.queues.iter().find(|slot| slot.kind == kind)
    }

    #[inline]
    pub(crate) fn timeline_of(&self, kind: QueueKind) -> Option<vk::Semaphore> {
        self.queue_slot(kind).map(|slot| slot.timeline)
    }

    /// 所有 queue 的 family，去重
    pub(crate) fn family_indices(&self) -> Vec<u32> {
        self.queues.iter().map(|slot| slot.family_index).unique().collect()
    }

    #[inline]
    pub(crate) fn check_alive(&self) -> RhiResult<()> {
        if self.lost.load(Ordering::Acquire) { Err(RhiError::DeviceLost) } else { Ok(()) }
    }
}
// tools
impl VulkanShared {
    pub(crate) fn next_object_id(&self) -> ObjectId {
        ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert_object(&self, object: VulkanObject) -> ObjectId {
        let id = self.next_object_id();
        self.objects.write().insert(id, object);
        id
    }

    /// 转换 vulkan 的错误，设备丢失之后的所有调用都会失败
    pub(crate) fn failure(&self, what: &str, result: vk::Result) -> RhiError {
        if result == vk::Result::ERROR_DEVICE_LOST && !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("vulkan device lost during {}", what);
        }
        vk_error(what, result)
    }

    #[inline]
    pub(crate) fn observe<T>(&self, result: Result<T, vk::Result>, what: &str) -> RhiResult<T> {
        result.map_err(|e| self.failure(what, e))
    }

    /// 等待所有 timeline point；超时返回 Ok(false)
    pub(crate) fn wait_points(&self, points: &[TimelinePoint], timeout: Duration) -> RhiResult<bool> {
        self.check_alive()?;
        if points.is_empty() {
            return Ok(true);
        }
        let mut semaphores = Vec::with_capacity(points.len());
        let mut values = Vec::with_capacity(points.len());
        for point in points {
            semaphores.push(self.timeline_of(point.queue).ok_or(RhiError::QueueUnavailable(point.queue))?);
            values.push(point.value);
        }
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        let timeout_ns = timeout.as_nanos().min(u64::MAX as u128) as u64;
        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(self.failure("wait semaphores", e)),
        }
    }
}

impl Drop for VulkanShared {
    fn drop(&mut self) {
        log::info!("Destroying vulkan backend");
        let device = &self.device.device;
        unsafe {
            if let Err(e) = device.device_wait_idle() {
                log::error!("device wait idle failed: {:?}", e);
            }
        }

        let objects: Vec<_> = self.objects.get_mut().drain().map(|(_, object)| object).collect();
        if !objects.is_empty() {
            log::warn!("{} vulkan objects are still alive", objects.len());
        }
        for object in objects {
            self.destroy_vulkan_object(object);
        }
        for (_, slot) in self.pools.get_mut().drain() {
            unsafe { device.destroy_command_pool(slot.pool, None) };
        }
        for slot in &self.queues {
            unsafe { device.destroy_semaphore(slot.timeline, None) };
        }
        self.memory.get_mut().destroy(device);

        self.device.destroy();
        self.instance.destroy();
    }
}

/// Vulkan 1.3 后端
///
/// 需要 synchronization2、timeline semaphore 和 dynamic rendering。
/// 每个 RHI queue 对应一个独立的 queue family，没有独立 family 的 queue 不会提供。
pub struct VulkanBackend {
    info: BackendInfo,
    shared: Arc<VulkanShared>,
    queues: Vec<Arc<VulkanQueue>>,
}
// new & init
impl VulkanBackend {
    /// display 是窗口系统的显示句柄，离屏渲染时传 None
    pub fn new(config: &VulkanConfig, display: Option<RawDisplayHandle>) -> RhiResult<Self> {
        let _span = truvis_rhi::rhi_span!("VulkanBackend::new");
        let mut instance = VulkanInstance::new(config, display)?;

        let (pdevice, memory, device) = match Self::create_device(&instance, config) {
            Ok(created) => created,
            Err(e) => {
                instance.destroy();
                return Err(e);
            }
        };

        // 之后任何失败都由 VulkanShared 的 drop 清理
        let mut queues = Vec::with_capacity(pdevice.queue_families.len());
        let mut init_error = None;
        for family in &pdevice.queue_families {
            let queue = unsafe { device.device.get_device_queue(family.family_index, 0) };
            let mut type_ci = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut type_ci);
            match unsafe { device.device.create_semaphore(&semaphore_ci, None) } {
                Ok(timeline) => {
                    device.set_object_debug_name(queue, &format!("{}-queue", family.kind));
                    device.set_object_debug_name(timeline, &format!("{}-timeline", family.kind));
                    queues.push(QueueSlot {
                        kind: family.kind,
                        family_index: family.family_index,
                        queue: Mutex::new(queue),
                        timeline,
                    });
                }
                Err(e) => {
                    init_error = Some(vk_error("create timeline semaphore", e));
                    break;
                }
            }
        }

        let info = BackendInfo {
            name: format!("vulkan ({})", pdevice.name()),
            queues: queues.iter().map(|slot| slot.kind).collect(),
            device_local_budget: Some(memory.heap_size(MemoryLocality::DeviceLocal)),
            host_visible_budget: Some(memory.heap_size(MemoryLocality::HostVisible)),
        };

        let shared = Arc::new(VulkanShared {
            instance,
            pdevice,
            device,
            queues,
            memory: Mutex::new(memory),
            objects: RwLock::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            next_object: AtomicU64::new(1),
            lost: AtomicBool::new(false),
        });
        if let Some(e) = init_error {
            return Err(e);
        }

        let queues = (0..shared.queues.len()).map(|i| Arc::new(VulkanQueue::new(shared.clone(), i))).collect();
        log::info!("vulkan backend created: {}, queues {:?}", info.name, info.queues);
        Ok(Self { info, shared, queues })
    }

    fn create_device(instance: &VulkanInstance, config: &VulkanConfig) -> RhiResult<(VulkanPhysicalDevice, MemoryPool, VulkanDevice)> {
        let pdevice = VulkanPhysicalDevice::pick(instance.ash_instance(), config.prefer_discrete_gpu)?;
        let memory = MemoryPool::new(&pdevice)?;
        let device = VulkanDevice::new(instance, &pdevice)?;
        Ok((pdevice, memory, device))
    }
}
// getters
impl VulkanBackend {
    #[inline]
    pub fn object_count(&self) -> usize {
        self.shared.objects.read().len()
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.shared.check_alive().is_err()
    }
}

impl GfxBackend for VulkanBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn queue(&self, kind: QueueKind) -> Option<Arc<dyn BackendQueue>> {
        self.queues
            .iter()
            .find(|q| q.kind() == kind)
            .map(|q| q.clone() as Arc<dyn BackendQueue>)
    }

    fn allocate_memory(&self, locality: MemoryLocality, size: u64) -> RhiResult<DeviceMemoryId> {
        self.shared.check_alive()?;
        self.shared.memory.lock().allocate(&self.shared.device.device, locality, size)
    }

    fn free_memory(&self, memory: DeviceMemoryId) {
        if !self.shared.memory.lock().free(&self.shared.device.device, memory) {
            log::warn!("vulkan: free of unknown memory {:?}", memory);
        }
    }

    fn write_memory(&self, memory: DeviceMemoryId, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.shared.memory.lock().write(memory, offset, data)
    }

    fn read_memory(&self, memory: DeviceMemoryId, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        self.shared.memory.lock().read(memory, offset, out)
    }

    fn memory_requirements(&self, desc: ObjectDesc<'_>) -> RhiResult<MemoryRequirements> {
        let device = &self.shared.device.device;
        let families = self.shared.family_indices();
        let mut requirements = vk::MemoryRequirements2::default();
        match desc {
            ObjectDesc::Buffer(desc) => {
                let create_info = self.shared.buffer_create_info(desc, &families);
                let info = vk::DeviceBufferMemoryRequirements::default().create_info(&create_info);
                unsafe { device.get_device_buffer_memory_requirements(&info, &mut requirements) };
            }
            ObjectDesc::Image(desc) => {
                let create_info = self.shared.image_create_info(desc, &families);
                let info = vk::DeviceImageMemoryRequirements::default().create_info(&create_info);
                unsafe { device.get_device_image_memory_requirements(&info, &mut requirements) };
            }
            _ => return Ok(MemoryRequirements { size: 0, alignment: 1 }),
        }
        Ok(MemoryRequirements {
            size: requirements.memory_requirements.size,
            alignment: requirements.memory_requirements.alignment,
        })
    }

    fn create_object(&self, desc: ObjectDesc<'_>, memory: Option<MemoryBinding>) -> RhiResult<ObjectId> {
        self.shared.check_alive()?;
        let object = match (desc, memory) {
            (ObjectDesc::Buffer(desc), Some(binding)) => self.shared.create_buffer(desc, &binding)?,
            (ObjectDesc::Image(desc), Some(binding)) => self.shared.create_image(desc, &binding)?,
            (ObjectDesc::Buffer(_) | ObjectDesc::Image(_), None) => {
                return Err(RhiError::Backend("buffer and image objects need a memory binding".into()));
            }
            (ObjectDesc::Sampler(desc), _) => self.shared.create_sampler(desc)?,
            (ObjectDesc::Pipeline(desc), _) => self.shared.create_pipeline(desc)?,
            (ObjectDesc::DescriptorSet(descriptors), _) => self.shared.create_descriptor_set(descriptors)?,
        };
        Ok(self.shared.insert_object(object))
    }

    fn destroy_object(&self, object: ObjectId) {
        let removed = self.shared.objects.write().remove(&object);
        match removed {
            Some(removed) => self.shared.destroy_vulkan_object(removed),
            None => log::warn!("vulkan: destroy of unknown object {:?}", object),
        }
    }

    fn create_encoder(&self, queue: QueueKind, slot: usize) -> RhiResult<Box<dyn CommandEncoder>> {
        self.shared.check_alive()?;
        let family_index = self
            .shared
            .queue_slot(queue)
            .map(|s| s.family_index)
            .ok_or(RhiError::QueueUnavailable(queue))?;
        let device = &self.shared.device.device;

        let command_buffer = {
            let mut pools = self.shared.pools.lock();
            let pool = match pools.entry((slot, queue)) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let pool = CommandPoolSlot::new(device, family_index)?;
                    self.shared.device.set_object_debug_name(pool.pool, &format!("slot{slot}-{queue}"));
                    entry.insert(pool)
                }
            };
            pool.take(device)?
        };
        Ok(Box::new(VulkanEncoder::new(self.shared.clone(), queue, command_buffer)?))
    }

    fn reset_command_pools(&self, slot: usize) -> RhiResult<()> {
        let device = &self.shared.device.device;
        let mut pools = self.shared.pools.lock();
        for ((pool_slot, _), pool) in pools.iter_mut() {
            if *pool_slot == slot {
                pool.reset(device)?;
            }
        }
        Ok(())
    }

    fn create_surface(&self, target: &SurfaceTarget) -> RhiResult<Box<dyn BackendSurface>> {
        match *target {
            SurfaceTarget::Window { display, window, .. } => {
                Ok(Box::new(VulkanSurface::new(self.shared.clone(), display, window)?))
            }
            SurfaceTarget::Headless { .. } => {
                Err(RhiError::Surface("vulkan backend needs a window, use an offscreen presenter".into()))
            }
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let result = unsafe { self.shared.device.device.device_wait_idle() };
        self.shared.observe(result, "device wait idle")
    }
}
