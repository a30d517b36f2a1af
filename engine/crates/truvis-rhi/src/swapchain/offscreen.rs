use std::path::{Path, PathBuf};

use crate::commands::RecordingSession;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::frame::{Fence, FrameIndex};
use crate::resource::desc::{BufferDesc, BufferUsage, Extent2d, Format, ImageDesc, ImageUsage, MemoryLocality};
use crate::resource::handles::{BufferHandle, ImageHandle};
use crate::swapchain::{PresentStatus, PresentTarget, Presenter};

/// 没有窗口时使用的 presenter，image 是普通的 device local image
///
/// 设置了输出目录时，每一帧呈现的内容会写成 `frame_00000.png` 这样的文件。
pub struct OffscreenPresenter {
    images: Vec<ImageHandle>,
    /// 只有写文件时才有，和 images 一一对应
    readback: Vec<BufferHandle>,

    extent: Extent2d,
    image_count: u32,
    next: u32,

    output_dir: Option<PathBuf>,
    frames_written: u64,
}

// new & init
impl OffscreenPresenter {
    pub const FORMAT: Format = Format::Rgba8Unorm;

    pub fn new(device: &Device, extent: Extent2d, image_count: u32) -> RhiResult<Self> {
        Self::create(device, extent, image_count, None)
    }

    /// 把每一帧写成 png 的 presenter
    pub fn file_writer(
        device: &Device,
        extent: Extent2d,
        image_count: u32,
        output_dir: impl Into<PathBuf>,
    ) -> RhiResult<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Self::create(device, extent, image_count, Some(output_dir))
    }

    fn create(device: &Device, extent: Extent2d, image_count: u32, output_dir: Option<PathBuf>) -> RhiResult<Self> {
        if image_count == 0 {
            return Err(RhiError::Config("offscreen presenter needs at least one image".to_string()));
        }
        let mut presenter = Self {
            images: Vec::new(),
            readback: Vec::new(),
            extent,
            image_count,
            next: 0,
            output_dir,
            frames_written: 0,
        };
        presenter.create_images(device)?;
        Ok(presenter)
    }

    fn create_images(&mut self, device: &Device) -> RhiResult<()> {
        let Extent2d { width, height } = self.extent;
        for i in 0..self.image_count {
            let image = device.create_image(ImageDesc::new_2d(
                width,
                height,
                Self::FORMAT,
                ImageUsage::COLOR_ATTACHMENT
                    | ImageUsage::SAMPLED
                    | ImageUsage::TRANSFER_SRC
                    | ImageUsage::TRANSFER_DST,
                format!("offscreen-{i}"),
            ))?;
            self.images.push(image);

            if self.output_dir.is_some() {
                let size = width as u64 * height as u64 * Self::FORMAT.texel_size();
                let buffer = device.create_buffer(BufferDesc::new(
                    size,
                    BufferUsage::TRANSFER_DST,
                    MemoryLocality::HostVisible,
                    format!("offscreen-readback-{i}"),
                ))?;
                self.readback.push(buffer);
            }
        }
        self.next = 0;
        Ok(())
    }
}
// getters
impl OffscreenPresenter {
    #[inline]
    pub fn images(&self) -> &[ImageHandle] {
        &self.images
    }

    #[inline]
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn frame_path(&self, frame: FrameIndex) -> Option<PathBuf> {
        self.output_dir.as_ref().map(|dir| dir.join(format!("frame_{:05}.png", frame.0)))
    }
}
// tools
impl OffscreenPresenter {
    fn write_png(&mut self, device: &Device, target: &PresentTarget, fence: &Fence) -> RhiResult<()> {
        let _span = crate::rhi_span!("OffscreenPresenter::write_png");
        let Some(path) = self.frame_path(target.frame) else {
            return Ok(());
        };
        let buffer = *self
            .readback
            .get(target.index as usize)
            .ok_or_else(|| RhiError::Surface(format!("no readback buffer for image {}", target.index)))?;

        let timeout = device.config().fence_timeout();
        if !fence.wait(timeout)? {
            return Err(RhiError::FenceTimeout {
                frame: target.frame,
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let Extent2d { width, height } = target.extent;
        let size = width as u64 * height as u64 * Self::FORMAT.texel_size();
        let pixels = device.read_buffer(buffer, 0..size)?;
        image::save_buffer(&path, &pixels, width, height, image::ColorType::Rgba8)
            .map_err(|e| RhiError::Io(format!("failed to write {}: {e}", path.display())))?;

        self.frames_written += 1;
        log::debug!("offscreen presenter wrote {}", path.display());
        Ok(())
    }
}
// destroy
impl OffscreenPresenter {
    fn release(&mut self, device: &Device) {
        for image in self.images.drain(..) {
            if let Err(e) = device.destroy(image) {
                log::warn!("failed to destroy offscreen image {:?}: {}", image, e);
            }
        }
        for buffer in self.readback.drain(..) {
            if let Err(e) = device.destroy(buffer) {
                log::warn!("failed to destroy readback buffer {:?}: {}", buffer, e);
            }
        }
    }

    pub fn destroy(mut self, device: &Device) {
        self.release(device);
    }
}

impl Presenter for OffscreenPresenter {
    #[inline]
    fn extent(&self) -> Extent2d {
        self.extent
    }

    #[inline]
    fn format(&self) -> Format {
        Self::FORMAT
    }

    fn acquire(&mut self, _device: &Device, frame: FrameIndex) -> RhiResult<PresentTarget> {
        let index = self.next;
        self.next = (self.next + 1) % self.image_count;
        Ok(PresentTarget {
            frame,
            image: self.images[index as usize],
            index,
            extent: self.extent,
            format: Self::FORMAT,
        })
    }

    fn record_present(&self, session: &mut RecordingSession<'_>, target: &PresentTarget) -> RhiResult<()> {
        match self.readback.get(target.index as usize) {
            Some(&buffer) => session.copy_image_to_buffer(target.image, buffer, 0),
            None => Ok(()),
        }
    }

    fn present(&mut self, device: &Device, target: PresentTarget, fence: &Fence) -> RhiResult<PresentStatus> {
        if device.is_lost() {
            return Err(RhiError::DeviceLost);
        }
        self.write_png(device, &target, fence)?;
        Ok(PresentStatus::Presented)
    }

    fn resize(&mut self, device: &Device, extent: Extent2d) -> RhiResult<()> {
        if extent == self.extent {
            return Ok(());
        }
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::Surface(format!("invalid extent {extent:?}")));
        }
        log::info!("offscreen presenter resized to {}x{}", extent.width, extent.height);
        self.release(device);
        self.extent = extent;
        self.create_images(device)
    }
}
