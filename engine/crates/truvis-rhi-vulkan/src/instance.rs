use std::collections::HashSet;
use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::RawDisplayHandle;
use truvis_rhi::{RhiError, RhiResult};

use crate::VulkanConfig;
use crate::convert::vk_error;
use crate::debug_messenger::VulkanDebugMsger;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct VulkanInstance {
    pub(crate) entry: ash::Entry,
    pub(crate) ash_instance: ash::Instance,
    pub(crate) surface_loader: ash::khr::surface::Instance,

    /// 只有开启了 debug utils 时才有
    debug_msger: Option<VulkanDebugMsger>,
    debug_utils_enabled: bool,
}

// new & init
impl VulkanInstance {
    /// 设置所需的 layers 和 extensions，创建 vk instance
    ///
    /// display 不为 None 时会开启在该显示系统上创建 surface 所需的 extension
    pub fn new(config: &VulkanConfig, display: Option<RawDisplayHandle>) -> RhiResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RhiError::Backend(format!("failed to load vulkan library: {e}")))?;

        let app_name = CString::new(config.app_name.as_str())
            .map_err(|_| RhiError::Config("app_name contains a nul byte".to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"truvis")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let supported_exts: HashSet<CString> = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(|e| vk_error("enumerate instance extensions", e))?
            .iter()
            .filter_map(|props| props.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

        let mut extensions: Vec<*const c_char> = Vec::new();
        if let Some(display) = display {
            let required = ash_window::enumerate_required_extensions(display)
                .map_err(|e| vk_error("enumerate surface extensions", e))?;
            extensions.extend_from_slice(required);
        }
        // debug utils 可以单独使用：debug messenger、object name、command buffer label
        let debug_utils_enabled = supported_exts.contains(vk::EXT_DEBUG_UTILS_NAME);
        if debug_utils_enabled {
            extensions.push(vk::EXT_DEBUG_UTILS_NAME.as_ptr());
        } else {
            log::warn!("{:?} is not supported, labels and object names are disabled", vk::EXT_DEBUG_UTILS_NAME);
        }
        log::info!(
            "instance extensions: {}",
            extensions.iter().map(|ext| format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) })).join("")
        );

        let layers = Self::get_layers(&entry, config.validation)?;
        let layer_ptrs = layers.iter().map(|layer| layer.as_ptr()).collect_vec();
        log::info!("instance layers: {:?}", layers);

        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_ptrs);

        // instance 创建和销毁期间的消息也需要 debug messenger
        let mut debug_utils_messenger_ci = VulkanDebugMsger::debug_utils_messenger_ci();
        if debug_utils_enabled {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        let ash_instance =
            unsafe { entry.create_instance(&instance_ci, None) }.map_err(|e| vk_error("create instance", e))?;

        let debug_msger = if debug_utils_enabled {
            match VulkanDebugMsger::new(&entry, &ash_instance) {
                Ok(msger) => Some(msger),
                Err(e) => {
                    log::warn!("failed to create debug messenger: {:?}", e);
                    None
                }
            }
        } else {
            None
        };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &ash_instance);

        Ok(Self {
            entry,
            ash_instance,
            surface_loader,
            debug_msger,
            debug_utils_enabled,
        })
    }

    /// validation layer 可以通过 vulkan configurator 打开，这里只在配置要求时显式开启
    fn get_layers(entry: &ash::Entry, validation: bool) -> RhiResult<Vec<&'static CStr>> {
        if !validation {
            return Ok(Vec::new());
        }
        let all_layer_props = unsafe { entry.enumerate_instance_layer_properties() }
            .map_err(|e| vk_error("enumerate instance layers", e))?;
        let supported = all_layer_props
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if supported {
            Ok(vec![VALIDATION_LAYER])
        } else {
            log::warn!("{:?} is not installed, validation is disabled", VALIDATION_LAYER);
            Ok(Vec::new())
        }
    }
}
// getters
impl VulkanInstance {
    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.ash_instance
    }

    #[inline]
    pub fn debug_utils_enabled(&self) -> bool {
        self.debug_utils_enabled
    }
}
// destroy
impl VulkanInstance {
    /// 调用者需要保证 device 和 surface 都已经销毁
    pub(crate) fn destroy(&mut self) {
        log::info!("Destroying VulkanInstance");
        self.debug_msger = None;
        unsafe {
            self.ash_instance.destroy_instance(None);
        }
    }
}
