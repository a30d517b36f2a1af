use std::ffi::CStr;

use ash::vk;
use itertools::Itertools;
use truvis_rhi::{QueueKind, RhiError, RhiResult};

use crate::convert::vk_error;

/// 一个 queue family 以及它承担的 RHI queue
#[derive(Clone, Debug)]
pub struct VulkanQueueFamily {
    pub kind: QueueKind,
    pub family_index: u32,
    pub queue_flags: vk::QueueFlags,
}

/// 表示一张物理显卡
pub struct VulkanPhysicalDevice {
    pub(crate) vk_handle: vk::PhysicalDevice,
    pub(crate) basic_props: vk::PhysicalDeviceProperties,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,

    /// 第一个是 graphics，之后是独立的 compute、transfer family
    pub(crate) queue_families: Vec<VulkanQueueFamily>,
}

// new & init
impl VulkanPhysicalDevice {
    /// 优先选择独立显卡，如果没有则选择第一个可用的显卡
    pub fn pick(instance: &ash::Instance, prefer_discrete: bool) -> RhiResult<Self> {
        let pdevices =
            unsafe { instance.enumerate_physical_devices() }.map_err(|e| vk_error("enumerate physical devices", e))?;
        let candidates = pdevices.iter().filter_map(|&pdevice| Self::new(pdevice, instance)).collect_vec();
        let picked = if prefer_discrete {
            candidates.into_iter().find_or_first(Self::is_discrete_gpu)
        } else {
            candidates.into_iter().next()
        };
        let picked = picked.ok_or_else(|| RhiError::Backend("no vulkan 1.3 device with a graphics queue".into()))?;
        log::info!("picked gpu: {}", picked.name());
        Ok(picked)
    }

    fn new(pdevice: vk::PhysicalDevice, instance: &ash::Instance) -> Option<Self> {
        let basic_props = unsafe { instance.get_physical_device_properties(pdevice) };
        let name = basic_props.device_name_as_c_str().unwrap_or(c"unknown").to_string_lossy().into_owned();
        if basic_props.api_version < vk::API_VERSION_1_3 {
            log::info!("skip gpu {}: vulkan 1.3 is not supported", name);
            return None;
        }

        // 找到所有的队列信息
        let queue_family_props = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        log::debug!("gpu {} queue families:\n{:#?}", name, queue_family_props);

        let find_queue_family = |kind: QueueKind, include_flags: vk::QueueFlags, exclude_flags: vk::QueueFlags| {
            queue_family_props
                .iter()
                .enumerate()
                .find(|(_, props)| {
                    props.queue_flags.contains(include_flags) && (props.queue_flags & exclude_flags).is_empty()
                })
                .map(|(family_index, props)| VulkanQueueFamily {
                    kind,
                    family_index: family_index as u32,
                    queue_flags: props.queue_flags,
                })
        };

        // 全能的 Queue：graphics, compute, transfer
        let Some(graphics) = find_queue_family(
            QueueKind::Graphics,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::empty(),
        ) else {
            log::info!("skip gpu {}: no graphics queue family", name);
            return None;
        };
        let mut queue_families = vec![graphics];
        // compute only
        queue_families.extend(find_queue_family(
            QueueKind::Compute,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS,
        ));
        // transfer only
        queue_families.extend(find_queue_family(
            QueueKind::Transfer,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        ));

        Some(Self {
            vk_handle: pdevice,
            basic_props,
            mem_props: unsafe { instance.get_physical_device_memory_properties(pdevice) },
            queue_families,
        })
    }
}
// getters
impl VulkanPhysicalDevice {
    #[inline]
    pub fn is_discrete_gpu(&self) -> bool {
        self.basic_props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    pub fn name(&self) -> String {
        self.basic_props.device_name_as_c_str().map(CStr::to_string_lossy).unwrap_or_default().into_owned()
    }

    #[inline]
    pub fn queue_kinds(&self) -> Vec<QueueKind> {
        self.queue_families.iter().map(|f| f.kind).collect()
    }

    /// 满足 required 的第一个 memory type，以及它所在 heap 的大小
    pub fn find_memory_type(&self, required: vk::MemoryPropertyFlags) -> Option<(u32, u64)> {
        let props = &self.mem_props;
        (0..props.memory_type_count).find_map(|i| {
            let ty = props.memory_types[i as usize];
            ty.property_flags
                .contains(required)
                .then(|| (i, props.memory_heaps[ty.heap_index as usize].size))
        })
    }
}
