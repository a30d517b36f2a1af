use std::sync::Arc;
use std::time::Duration;

use crate::backend::headless::{HeadlessObject, HeadlessShared};
use crate::backend::{AcquireOutcome, BackendSurface, DeviceMemoryId, MemoryBinding, ObjectId, SurfaceImage};
use crate::error::{RhiError, RhiResult};
use crate::queue::TimelinePoint;
use crate::resource::desc::{Extent2d, Format, ImageDesc, ImageUsage, MemoryLocality};
use crate::swapchain::{PresentMode, PresentStatus};

/// headless surface 的一次呈现
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresentEvent {
    pub index: u32,
    pub image: ObjectId,
    pub waits: Vec<TimelinePoint>,
    pub present_mode: PresentMode,
}

/// 没有窗口的 surface，image 放在后端的模拟内存中
pub(crate) struct HeadlessSurface {
    shared: Arc<HeadlessShared>,
    images: Vec<(ObjectId, DeviceMemoryId)>,
    next_index: u32,
    present_mode: PresentMode,
}

impl HeadlessSurface {
    pub const FORMAT: Format = Format::Bgra8Unorm;

    pub fn new(shared: Arc<HeadlessShared>) -> Self {
        Self {
            shared,
            images: Vec::new(),
            next_index: 0,
            present_mode: PresentMode::Fifo,
        }
    }

    fn release_images(&mut self) {
        let mut objects = self.shared.objects.write();
        let mut memory = self.shared.memory.lock();
        for (object, mem) in self.images.drain(..) {
            objects.remove(&object);
            memory.free(mem);
        }
    }
}

impl BackendSurface for HeadlessSurface {
    fn configure(
        &mut self,
        extent: Extent2d,
        present_mode: PresentMode,
        image_count: u32,
    ) -> RhiResult<Vec<SurfaceImage>> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::Surface(format!("invalid surface extent {extent:?}")));
        }
        self.release_images();
        self.present_mode = present_mode;
        self.next_index = 0;

        let mut images = Vec::with_capacity(image_count as usize);
        for i in 0..image_count {
            let desc = ImageDesc::new_2d(
                extent.width,
                extent.height,
                Self::FORMAT,
                ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
                format!("surface-image-{i}"),
            );
            let size = desc.total_size();
            let memory = self.shared.memory.lock().allocate(MemoryLocality::DeviceLocal, size, true)?;
            let object = self.shared.next_object_id();
            self.shared.objects.write().insert(
                object,
                HeadlessObject::Image {
                    binding: MemoryBinding { memory, offset: 0, size },
                    desc: desc.clone(),
                },
            );
            self.images.push((object, memory));
            images.push(SurfaceImage { object, desc });
        }
        log::debug!("headless surface configured: {:?}, {} images, {:?}", extent, image_count, present_mode);
        Ok(images)
    }

    fn acquire(&mut self, _timeout: Duration) -> RhiResult<AcquireOutcome> {
        if self.shared.timeline.is_lost() {
            return Err(RhiError::DeviceLost);
        }
        if self.images.is_empty() {
            return Ok(AcquireOutcome::OutOfDate);
        }
        let index = self.next_index;
        self.next_index = (self.next_index + 1) % self.images.len() as u32;
        Ok(AcquireOutcome::Acquired {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, index: u32, wait: &[TimelinePoint]) -> RhiResult<PresentStatus> {
        let Some(&(image, _)) = self.images.get(index as usize) else {
            return Err(RhiError::Surface(format!("present of unknown image index {index}")));
        };
        self.shared.presents.lock().push(PresentEvent {
            index,
            image,
            waits: wait.to_vec(),
            present_mode: self.present_mode,
        });
        Ok(PresentStatus::Presented)
    }
}

impl Drop for HeadlessSurface {
    fn drop(&mut self) {
        self.release_images();
    }
}
