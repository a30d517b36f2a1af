//! truvis-rhi 的 Vulkan 后端
//!
//! 要求 Vulkan 1.3：提交使用 synchronization2 和 timeline semaphore，渲染使用 dynamic rendering。
//! 每个 RHI queue 对应一个 queue family 和一个 timeline semaphore，RHI 的 timeline value 直接作为
//! semaphore 的 value 使用。
//!
//! ```ignore
//! let (device, backend) = truvis_rhi_vulkan::create_device(RhiConfig::default(), &VulkanConfig::default(), None)?;
//! ```

use std::sync::Arc;

use raw_window_handle::RawDisplayHandle;
use truvis_rhi::{Device, RhiConfig, RhiResult};

mod backend;
mod convert;
mod debug_messenger;
mod device;
mod encoder;
mod instance;
mod memory;
mod objects;
mod physical_device;
mod queue;
mod surface;

pub use backend::VulkanBackend;
pub use queue::VulkanQueue;
pub use surface::VulkanSurface;

#[derive(Clone, Debug)]
pub struct VulkanConfig {
    pub app_name: String,
    /// 打开 VK_LAYER_KHRONOS_validation，未安装时忽略
    pub validation: bool,
    pub prefer_discrete_gpu: bool,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            app_name: "truvis".to_string(),
            validation: cfg!(debug_assertions),
            prefer_discrete_gpu: true,
        }
    }
}

/// 创建 Vulkan 后端以及在它之上的 Device
pub fn create_device(
    config: RhiConfig,
    vk_config: &VulkanConfig,
    display: Option<RawDisplayHandle>,
) -> RhiResult<(Device, Arc<VulkanBackend>)> {
    let backend = Arc::new(VulkanBackend::new(vk_config, display)?);
    let device = Device::new(backend.clone(), config)?;
    Ok((device, backend))
}
