use std::ffi::{CStr, CString};

use ash::vk;
use itertools::Itertools;
use truvis_rhi::RhiResult;

use crate::convert::vk_error;
use crate::instance::VulkanInstance;
use crate::physical_device::VulkanPhysicalDevice;

/// Vulkan 逻辑设备封装
///
/// 包含核心设备 API 以及用到的扩展的函数指针，在设备的整个生命周期中不变。
/// 需要的 1.3 特性：synchronization2、timeline semaphore、dynamic rendering。
pub struct VulkanDevice {
    pub(crate) device: ash::Device,
    pub(crate) swapchain: ash::khr::swapchain::Device,
    /// instance 没有开启 debug utils 时为 None
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,
}

// new & init
impl VulkanDevice {
    pub fn new(instance: &VulkanInstance, pdevice: &VulkanPhysicalDevice) -> RhiResult<Self> {
        let _span = truvis_rhi::rhi_span!("VulkanDevice::new");
        let ash_instance = instance.ash_instance();

        let priorities = [1.0_f32];
        let queue_create_infos = pdevice
            .queue_families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.family_index)
                    .queue_priorities(&priorities)
            })
            .collect_vec();

        // 不支持 swapchain 时只能离屏渲染
        let supported_exts = unsafe { ash_instance.enumerate_device_extension_properties(pdevice.vk_handle) }
            .map_err(|e| vk_error("enumerate device extensions", e))?;
        let has_swapchain = supported_exts
            .iter()
            .any(|props| props.extension_name_as_c_str().is_ok_and(|name| name == ash::khr::swapchain::NAME));
        let device_exts: Vec<&CStr> = if has_swapchain { vec![ash::khr::swapchain::NAME] } else { Vec::new() };
        log::info!("device exts: {}", device_exts.iter().map(|ext| format!("\n\t{:?}", ext)).join(""));
        let device_ext_ptrs = device_exts.iter().map(|ext| ext.as_ptr()).collect_vec();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);
        let mut all_features = vk::PhysicalDeviceFeatures2::default()
            .features(vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true))
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut all_features);

        let device = unsafe { ash_instance.create_device(pdevice.vk_handle, &device_create_info, None) }
            .map_err(|e| vk_error("create device", e))?;

        let swapchain = ash::khr::swapchain::Device::new(ash_instance, &device);
        let debug_utils = instance
            .debug_utils_enabled()
            .then(|| ash::ext::debug_utils::Device::new(ash_instance, &device));

        Ok(Self {
            device,
            swapchain,
            debug_utils,
        })
    }
}
// tools
impl VulkanDevice {
    /// 为 vulkan 对象设置 debug name，在 RenderDoc 和 validation 的消息中可见
    pub fn set_object_debug_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        unsafe {
            if let Err(e) = debug_utils.set_debug_utils_object_name(&name_info) {
                log::warn!("failed to set debug name {:?}: {:?}", name, e);
            }
        }
    }
}
// destroy
impl VulkanDevice {
    /// 调用者需要保证所有子对象都已经销毁
    pub(crate) fn destroy(&self) {
        log::info!("destroying device");
        unsafe {
            self.device.destroy_device(None);
        }
    }
}
