//! 呈现
//!
//! `Presenter` 是帧循环和呈现目标之间的接口：
//!
//! 1. `acquire`：在 `begin_frame` 之后获取这一帧要写入的 image
//! 2. `record_present`：在这一帧最后一个 stream 中声明呈现需要的访问
//! 3. `present`：`submit_frame` 之后，在 fence 的所有 point 到达之后呈现
//!
//! 有窗口时使用 `Swapchain`，没有窗口时使用 `OffscreenPresenter`。

pub mod offscreen;
pub mod render_swapchain;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use serde::Deserialize;

pub use offscreen::OffscreenPresenter;
pub use render_swapchain::Swapchain;

use crate::commands::RecordingSession;
use crate::device::Device;
use crate::error::RhiResult;
use crate::frame::{Fence, FrameIndex};
use crate::resource::desc::{Extent2d, Format};
use crate::resource::handles::ImageHandle;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentMode {
    /// 垂直同步
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

impl PresentMode {
    #[inline]
    pub fn from_vsync(vsync: bool) -> Self {
        if vsync { PresentMode::Fifo } else { PresentMode::Mailbox }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// 已经呈现，但 surface 的属性和 image 不再完全匹配，下一次 acquire 时重建
    Suboptimal,
    /// 没有呈现，需要重建
    OutOfDate,
}

/// 窗口系统提供的呈现目标
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SurfaceTarget {
    Window {
        display: RawDisplayHandle,
        window: RawWindowHandle,
        extent: Extent2d,
    },
    /// 没有窗口，由后端自己模拟
    Headless { extent: Extent2d },
}

impl SurfaceTarget {
    #[inline]
    pub fn headless(extent: Extent2d) -> Self {
        SurfaceTarget::Headless { extent }
    }

    #[inline]
    pub fn extent(&self) -> Extent2d {
        match self {
            SurfaceTarget::Window { extent, .. } | SurfaceTarget::Headless { extent } => *extent,
        }
    }
}

/// 这一帧要写入并呈现的 image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentTarget {
    pub frame: FrameIndex,
    pub image: ImageHandle,
    /// 在 presenter 的 image 数组中的下标
    pub index: u32,
    pub extent: Extent2d,
    pub format: Format,
}

pub trait Presenter: Send {
    fn extent(&self) -> Extent2d;

    fn format(&self) -> Format;

    fn acquire(&mut self, device: &Device, frame: FrameIndex) -> RhiResult<PresentTarget>;

    /// 声明 target 在这一帧结束时的访问，需要在最后写入 target 的 stream 中调用
    fn record_present(&self, session: &mut RecordingSession<'_>, target: &PresentTarget) -> RhiResult<()>;

    /// 在 fence 完成之后呈现 target
    fn present(&mut self, device: &Device, target: PresentTarget, fence: &Fence) -> RhiResult<PresentStatus>;

    /// 窗口大小变化。调用者需要保证没有打开的帧
    fn resize(&mut self, device: &Device, extent: Extent2d) -> RhiResult<()>;
}
