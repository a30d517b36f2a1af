use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use truvis_rhi::backend::{AcquireOutcome, BackendSurface, ObjectId, SurfaceImage};
use truvis_rhi::resource::desc::{Extent2d, ImageDesc};
use truvis_rhi::swapchain::{PresentMode, PresentStatus};
use truvis_rhi::{QueueKind, RhiError, RhiResult, TimelinePoint};

use crate::backend::VulkanShared;
use crate::convert::{self, vk_error};

/// 窗口的 surface 和它的 swapchain
///
/// acquire 使用 fence 在 CPU 上等待 image 可用；present 之前在 CPU 上等待 timeline，
/// 所以 swapchain 不需要 binary semaphore。
pub struct VulkanSurface {
    shared: Arc<VulkanShared>,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,

    images: Vec<ObjectId>,
    acquire_fence: vk::Fence,
}

// new & init
impl VulkanSurface {
    pub(crate) fn new(shared: Arc<VulkanShared>, display: RawDisplayHandle, window: RawWindowHandle) -> RhiResult<Self> {
        let _span = truvis_rhi::rhi_span!("VulkanSurface::new");
        let instance = &shared.instance;
        let surface = unsafe {
            ash_window::create_surface(&instance.entry, &instance.ash_instance, display, window, None)
        }
        .map_err(|e| vk_error("create surface", e))?;

        let graphics_family = shared.queue_slot(QueueKind::Graphics).map(|slot| slot.family_index).unwrap_or(0);
        let supported = unsafe {
            instance.surface_loader.get_physical_device_surface_support(
                shared.pdevice.vk_handle,
                graphics_family,
                surface,
            )
        };
        if !matches!(supported, Ok(true)) {
            unsafe { instance.surface_loader.destroy_surface(surface, None) };
            return Err(RhiError::Surface("graphics queue can not present to this surface".into()));
        }

        let acquire_fence = match unsafe { shared.device.device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { instance.surface_loader.destroy_surface(surface, None) };
                return Err(vk_error("create fence", e));
            }
        };

        Ok(Self {
            shared,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            acquire_fence,
        })
    }
}
// tools
impl VulkanSurface {
    /// 如果 current_extent 是特殊值 0xFFFFFFFF，表示可以自己设置 swapchain 的 extent
    pub fn calculate_swapchain_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_extent: Extent2d) -> vk::Extent2D {
        let surface_extent = capabilities.current_extent;
        if surface_extent.width == u32::MAX || surface_extent.height == u32::MAX {
            vk::Extent2D {
                width: window_extent
                    .width
                    .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
                height: window_extent
                    .height
                    .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
            }
        } else {
            surface_extent
        }
    }

    /// max_image_count == 0 表示不限制 image 数量
    pub fn calculate_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
        let count = requested.max(capabilities.min_image_count);
        if capabilities.max_image_count == 0 { count } else { count.min(capabilities.max_image_count) }
    }

    fn choose_format(&self) -> RhiResult<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.shared
                .instance
                .surface_loader
                .get_physical_device_surface_formats(self.shared.pdevice.vk_handle, self.surface)
        }
        .map_err(|e| vk_error("get surface formats", e))?;
        formats
            .iter()
            .find(|f| f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .or_else(|| formats.iter().find(|f| convert::surface_format(f.format).is_some()))
            .copied()
            .ok_or_else(|| RhiError::Surface("no supported surface format".into()))
    }

    fn choose_present_mode(&self, requested: PresentMode) -> RhiResult<vk::PresentModeKHR> {
        let modes = unsafe {
            self.shared
                .instance
                .surface_loader
                .get_physical_device_surface_present_modes(self.shared.pdevice.vk_handle, self.surface)
        }
        .map_err(|e| vk_error("get surface present modes", e))?;
        let wanted = convert::present_mode(requested);
        if modes.contains(&wanted) {
            Ok(wanted)
        } else {
            // FIFO 总是支持的
            log::warn!("present mode {:?} is not supported, fall back to FIFO", requested);
            Ok(vk::PresentModeKHR::FIFO)
        }
    }

    fn release_images(&mut self) {
        let mut objects = self.shared.objects.write();
        for id in self.images.drain(..) {
            if let Some(object) = objects.remove(&id) {
                self.shared.destroy_vulkan_object(object);
            }
        }
    }
}

impl BackendSurface for VulkanSurface {
    fn configure(
        &mut self,
        extent: Extent2d,
        present_mode: PresentMode,
        image_count: u32,
    ) -> RhiResult<Vec<SurfaceImage>> {
        let _span = truvis_rhi::rhi_span!("VulkanSurface::configure");
        let shared = self.shared.clone();
        let capabilities = unsafe {
            shared
                .instance
                .surface_loader
                .get_physical_device_surface_capabilities(shared.pdevice.vk_handle, self.surface)
        }
        .map_err(|e| vk_error("get surface capabilities", e))?;

        let vk_extent = Self::calculate_swapchain_extent(&capabilities, extent);
        if vk_extent.width == 0 || vk_extent.height == 0 {
            return Err(RhiError::Surface(format!("invalid surface extent {extent:?}")));
        }
        let surface_format = self.choose_format()?;
        let format = convert::surface_format(surface_format.format)
            .ok_or_else(|| RhiError::Surface(format!("unsupported surface format {:?}", surface_format.format)))?;
        let vk_present_mode = self.choose_present_mode(present_mode)?;
        let min_image_count = Self::calculate_image_count(&capabilities, image_count);

        // TRANSFER_DST 用于 clear 和 blit，TRANSFER_SRC 用于截图
        let wanted_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;
        let usage = wanted_usage & capabilities.supported_usage_flags;

        log::info!(
            "create swapchain:
            surface current extent: {}x{}, min extent: {}x{}, max extent: {}x{}
            window extent: {}x{}
            final swapchain extent: {}x{}",
            capabilities.current_extent.width,
            capabilities.current_extent.height,
            capabilities.min_image_extent.width,
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.width,
            capabilities.max_image_extent.height,
            extent.width,
            extent.height,
            vk_extent.width,
            vk_extent.height
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(vk_extent)
            .image_array_layers(1)
            .image_usage(usage)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk_present_mode)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .clipped(true)
            .old_swapchain(self.swapchain);
        let swapchain = unsafe { shared.device.swapchain.create_swapchain(&create_info, None) }
            .map_err(|e| vk_error("create swapchain", e))?;

        // 调用者保证旧的 image 已经不再使用
        self.release_images();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { shared.device.swapchain.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = swapchain;
        shared.device.set_object_debug_name(swapchain, "main");

        let vk_images = unsafe { shared.device.swapchain.get_swapchain_images(swapchain) }
            .map_err(|e| vk_error("get swapchain images", e))?;
        let mut images = Vec::with_capacity(vk_images.len());
        for (i, vk_image) in vk_images.into_iter().enumerate() {
            let desc = ImageDesc::new_2d(
                vk_extent.width,
                vk_extent.height,
                format,
                convert::image_usage_from_vk(usage),
                format!("swapchain-image-{i}"),
            );
            shared.device.set_object_debug_name(vk_image, &desc.label);
            let object = shared.wrap_image(vk_image, &desc, false)?;
            let id = shared.insert_object(object);
            self.images.push(id);
            images.push(SurfaceImage { object: id, desc });
        }
        Ok(images)
    }

    fn acquire(&mut self, timeout: Duration) -> RhiResult<AcquireOutcome> {
        let _span = truvis_rhi::rhi_span!("VulkanSurface::acquire");
        let device = &self.shared.device;
        let timeout_ns = timeout.as_nanos().min(u64::MAX as u128) as u64;
        let result = unsafe {
            device
                .swapchain
                .acquire_next_image(self.swapchain, timeout_ns, vk::Semaphore::null(), self.acquire_fence)
        };
        let (index, suboptimal) = match result {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                return Err(RhiError::Surface(format!("acquire timed out after {timeout:?}")));
            }
            Err(e) => return Err(self.shared.failure("acquire next image", e)),
        };
        if suboptimal {
            log::warn!("swapchain acquire image index {} is not optimal", index);
        }

        let fences = [self.acquire_fence];
        let waited = unsafe { device.device.wait_for_fences(&fences, true, timeout_ns) }
            .and_then(|_| unsafe { device.device.reset_fences(&fences) });
        self.shared.observe(waited, "wait acquire fence")?;
        Ok(AcquireOutcome::Acquired { index, suboptimal })
    }

    fn present(&mut self, index: u32, wait: &[TimelinePoint]) -> RhiResult<PresentStatus> {
        let _span = truvis_rhi::rhi_span!("VulkanSurface::present");
        if !self.shared.wait_points(wait, VulkanShared::PRESENT_WAIT_TIMEOUT)? {
            return Err(RhiError::Surface("present timed out waiting for the frame".into()));
        }

        let slot = self
            .shared
            .queue_slot(QueueKind::Graphics)
            .ok_or(RhiError::QueueUnavailable(QueueKind::Graphics))?;
        let swapchains = [self.swapchain];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default().swapchains(&swapchains).image_indices(&indices);
        let queue = slot.queue.lock();
        match unsafe { self.shared.device.swapchain.queue_present(*queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(self.shared.failure("queue present", e)),
        }
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        log::info!("Destroying VulkanSurface");
        if let Err(e) = unsafe { self.shared.device.device.device_wait_idle() } {
            log::error!("device wait idle failed before destroying the surface: {:?}", e);
        }
        self.release_images();
        unsafe {
            if self.swapchain != vk::SwapchainKHR::null() {
                self.shared.device.swapchain.destroy_swapchain(self.swapchain, None);
            }
            self.shared.device.device.destroy_fence(self.acquire_fence, None);
            self.shared.instance.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
