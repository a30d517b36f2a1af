use std::time::Duration;

use crate::backend::{AcquireOutcome, BackendSurface};
use crate::commands::RecordingSession;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::frame::{Fence, FrameIndex};
use crate::queue::TimelinePoint;
use crate::resource::desc::{Extent2d, Format};
use crate::resource::handles::ImageHandle;
use crate::swapchain::{PresentMode, PresentStatus, PresentTarget, Presenter, SurfaceTarget};

/// 由 surface 提供 image 的 presenter
///
/// image 由 surface 持有，只作为外部资源登记到资源表中；重建时旧的句柄失效。
pub struct Swapchain {
    surface: Box<dyn BackendSurface>,
    images: Vec<ImageHandle>,

    extent: Extent2d,
    format: Format,
    present_mode: PresentMode,
    image_count: u32,

    /// 上一次 acquire 或 present 报告 surface 已经不匹配
    need_recreate: bool,
}

// new & init
impl Swapchain {
    pub fn new(device: &Device, target: &SurfaceTarget) -> RhiResult<Self> {
        let _span = crate::rhi_span!("Swapchain::new");
        let config = &device.config().swapchain;
        let surface = device.backend().create_surface(target)?;

        let mut swapchain = Self {
            surface,
            images: Vec::new(),
            extent: target.extent(),
            format: Format::Bgra8Unorm,
            present_mode: config.present_mode,
            image_count: config.image_count,
            need_recreate: false,
        };
        swapchain.configure(device, target.extent())?;
        Ok(swapchain)
    }

    /// 重新创建 surface 的 image
    fn configure(&mut self, device: &Device, extent: Extent2d) -> RhiResult<()> {
        self.release_images(device);

        let surface_images = self.surface.configure(extent, self.present_mode, self.image_count)?;
        let Some(first) = surface_images.first() else {
            return Err(RhiError::Surface("surface returned no images".to_string()));
        };
        self.format = first.desc.format;
        self.extent = Extent2d::new(first.desc.extent.width, first.desc.extent.height);

        for image in surface_images {
            let handle = device.register_external_image(image.desc, image.object)?;
            self.images.push(handle);
        }
        self.need_recreate = false;
        log::info!(
            "swapchain configured: {}x{}, {:?}, {} images, {:?}",
            self.extent.width,
            self.extent.height,
            self.format,
            self.images.len(),
            self.present_mode
        );
        Ok(())
    }

    fn recreate(&mut self, device: &Device) -> RhiResult<()> {
        log::info!("recreate swapchain");
        device.wait_idle()?;
        self.configure(device, self.extent)
    }
}
// getters
impl Swapchain {
    #[inline]
    pub fn images(&self) -> &[ImageHandle] {
        &self.images
    }

    #[inline]
    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }
}
// tools
impl Swapchain {
    /// 修改 present mode，在下一次 acquire 时生效
    pub fn set_present_mode(&mut self, present_mode: PresentMode) {
        if self.present_mode != present_mode {
            self.present_mode = present_mode;
            self.need_recreate = true;
        }
    }
}
// destroy
impl Swapchain {
    fn release_images(&mut self, device: &Device) {
        for handle in self.images.drain(..) {
            if let Err(e) = device.destroy(handle) {
                log::warn!("failed to release swapchain image {:?}: {}", handle, e);
            }
        }
    }

    pub fn destroy(mut self, device: &Device) {
        self.release_images(device);
    }
}

impl Presenter for Swapchain {
    #[inline]
    fn extent(&self) -> Extent2d {
        self.extent
    }

    #[inline]
    fn format(&self) -> Format {
        self.format
    }

    fn acquire(&mut self, device: &Device, frame: FrameIndex) -> RhiResult<PresentTarget> {
        let _span = crate::rhi_span!("Swapchain::acquire");
        if self.need_recreate {
            self.recreate(device)?;
        }

        let timeout: Duration = device.config().fence_timeout();
        let (index, suboptimal) = match self.surface.acquire(timeout)? {
            AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => {
                self.recreate(device)?;
                match self.surface.acquire(timeout)? {
                    AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
                    AcquireOutcome::OutOfDate => {
                        return Err(RhiError::Surface("surface is still out of date after recreation".to_string()));
                    }
                }
            }
        };
        if suboptimal {
            log::warn!("swapchain acquire image index {} is not optimal", index);
            self.need_recreate = true;
        }

        let image = *self
            .images
            .get(index as usize)
            .ok_or_else(|| RhiError::Surface(format!("acquired unknown image index {index}")))?;
        Ok(PresentTarget {
            frame,
            image,
            index,
            extent: self.extent,
            format: self.format,
        })
    }

    fn record_present(&self, session: &mut RecordingSession<'_>, target: &PresentTarget) -> RhiResult<()> {
        session.prepare_present(target.image)
    }

    fn present(&mut self, device: &Device, target: PresentTarget, fence: &Fence) -> RhiResult<PresentStatus> {
        let _span = crate::rhi_span!("Swapchain::present");
        if device.is_lost() {
            return Err(RhiError::DeviceLost);
        }
        let waits: Vec<TimelinePoint> = fence.points().collect();
        let status = self.surface.present(target.index, &waits)?;
        match status {
            PresentStatus::Presented => {}
            PresentStatus::Suboptimal | PresentStatus::OutOfDate => {
                log::warn!("present {} returned {:?}", target.frame, status);
                self.need_recreate = true;
            }
        }
        Ok(status)
    }

    fn resize(&mut self, device: &Device, extent: Extent2d) -> RhiResult<()> {
        if extent == self.extent && !self.need_recreate {
            return Ok(());
        }
        device.wait_idle()?;
        self.configure(device, extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{ClearValue, Command, WorkerId};
    use crate::config::RhiConfig;
    use crate::queue::QueueKind;
    use crate::sync::{HazardKind, ImageLayout};

    #[test]
    fn test_present_waits_on_frame_fence() {
        let (device, backend) = Device::headless(RhiConfig::default()).unwrap();
        let mut swapchain = Swapchain::new(&device, &SurfaceTarget::headless(Extent2d::new(64, 32))).unwrap();
        assert_eq!(swapchain.images().len(), 3);
        assert_eq!(swapchain.extent(), Extent2d::new(64, 32));

        let frame = device.begin_frame().unwrap();
        let target = swapchain.acquire(&device, frame).unwrap();
        let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
        let mut session = recorder.begin(frame).unwrap();
        session.clear_image(target.image, ClearValue::Color([0.0, 0.0, 1.0, 1.0])).unwrap();
        swapchain.record_present(&mut session, &target).unwrap();
        let stream = session.end().unwrap();

        // 清除之后转换到 present layout
        let barriers: Vec<_> = stream
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Barrier(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].hazard, HazardKind::ReadAfterWrite);
        assert_eq!(barriers[0].new_layout, ImageLayout::Present);

        let fence = device.submit_frame(frame, vec![stream]).unwrap();
        let status = swapchain.present(&device, target, &fence).unwrap();
        assert_eq!(status, PresentStatus::Presented);

        let presents = backend.presents();
        assert_eq!(presents.len(), 1);
        assert_eq!(presents[0].index, target.index);
        assert_eq!(presents[0].waits, fence.points().collect::<Vec<_>>());
    }

    #[test]
    fn test_resize_invalidates_old_images() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let mut swapchain = Swapchain::new(&device, &SurfaceTarget::headless(Extent2d::new(64, 64))).unwrap();
        let old = swapchain.images().to_vec();

        swapchain.resize(&device, Extent2d::new(32, 16)).unwrap();
        assert_eq!(swapchain.extent(), Extent2d::new(32, 16));
        assert_eq!(swapchain.images().len(), old.len());
        for handle in old {
            assert!(matches!(device.label_of(handle), Err(RhiError::StaleHandle { .. })));
        }

        let frame = device.begin_frame().unwrap();
        let target = swapchain.acquire(&device, frame).unwrap();
        assert_eq!(target.extent, Extent2d::new(32, 16));
        assert!(swapchain.images().contains(&target.image));
    }
}
