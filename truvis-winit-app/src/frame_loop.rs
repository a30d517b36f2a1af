use std::time::{Duration, Instant};

use anyhow::Context;
use raw_window_handle::RawDisplayHandle;
use truvis_rhi::resource::desc::{Extent2d, Format};
use truvis_rhi::swapchain::{PresentTarget, SurfaceTarget};
use truvis_rhi::{
    Device, Fence, FrameIndex, OffscreenPresenter, PresentStatus, Presenter, RecordingSession, RhiResult, Swapchain,
};
use truvis_rhi_vulkan::VulkanConfig;

use crate::cli::{BackendKind, RenderOptions};
use crate::scene::{DemoScene, FrameParams};

/// 按命令行选项创建 Device，display 只在有窗口时提供
pub fn create_device(opts: &RenderOptions, display: Option<RawDisplayHandle>) -> anyhow::Result<Device> {
    let config = opts.rhi_config()?;
    let device = match opts.backend {
        BackendKind::Headless => Device::headless(config).map(|(device, _)| device)?,
        BackendKind::Vulkan => {
            let vk_config = VulkanConfig {
                app_name: "rhi-demo".to_string(),
                validation: config.debug.validation,
                ..Default::default()
            };
            truvis_rhi_vulkan::create_device(config, &vk_config, display)
                .map(|(device, _)| device)
                .context("failed to create vulkan device")?
        }
    };
    log::info!("device created on {}", device.backend_info().name);
    Ok(device)
}

/// 窗口使用 swapchain，离屏使用 offscreen presenter
pub enum DemoPresenter {
    Window(Swapchain),
    Offscreen(OffscreenPresenter),
}

impl DemoPresenter {
    pub fn destroy(self, device: &Device) {
        match self {
            DemoPresenter::Window(swapchain) => swapchain.destroy(device),
            DemoPresenter::Offscreen(offscreen) => offscreen.destroy(device),
        }
    }
}

impl Presenter for DemoPresenter {
    fn extent(&self) -> Extent2d {
        match self {
            DemoPresenter::Window(p) => p.extent(),
            DemoPresenter::Offscreen(p) => p.extent(),
        }
    }

    fn format(&self) -> Format {
        match self {
            DemoPresenter::Window(p) => p.format(),
            DemoPresenter::Offscreen(p) => p.format(),
        }
    }

    fn acquire(&mut self, device: &Device, frame: FrameIndex) -> RhiResult<PresentTarget> {
        match self {
            DemoPresenter::Window(p) => p.acquire(device, frame),
            DemoPresenter::Offscreen(p) => p.acquire(device, frame),
        }
    }

    fn record_present(&self, session: &mut RecordingSession<'_>, target: &PresentTarget) -> RhiResult<()> {
        match self {
            DemoPresenter::Window(p) => p.record_present(session, target),
            DemoPresenter::Offscreen(p) => p.record_present(session, target),
        }
    }

    fn present(&mut self, device: &Device, target: PresentTarget, fence: &Fence) -> RhiResult<PresentStatus> {
        match self {
            DemoPresenter::Window(p) => p.present(device, target, fence),
            DemoPresenter::Offscreen(p) => p.present(device, target, fence),
        }
    }

    fn resize(&mut self, device: &Device, extent: Extent2d) -> RhiResult<()> {
        match self {
            DemoPresenter::Window(p) => p.resize(device, extent),
            DemoPresenter::Offscreen(p) => p.resize(device, extent),
        }
    }
}

/// 帧循环结束时的统计
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub elapsed: Duration,
    pub average_fps: f32,
    pub total_stall: Duration,
    pub max_in_flight: usize,
}

/// 一帧的完整流程：begin_frame -> acquire -> 多线程录制 -> submit_frame -> present
pub struct FrameRunner {
    device: Device,
    presenter: DemoPresenter,
    scene: DemoScene,

    frames_rendered: u64,
    last_frame: Option<FrameIndex>,
    started: Instant,
}

// new & init
impl FrameRunner {
    pub fn new(device: Device, presenter: DemoPresenter, workers: usize) -> anyhow::Result<Self> {
        let scene = DemoScene::new(&device, workers).context("failed to create demo scene")?;
        Ok(Self {
            device,
            presenter,
            scene,
            frames_rendered: 0,
            last_frame: None,
            started: Instant::now(),
        })
    }

    /// 离屏渲染：设置了输出目录时把每一帧写成 png
    pub fn offscreen(opts: &RenderOptions) -> anyhow::Result<Self> {
        let device = create_device(opts, None)?;
        let image_count = device.config().swapchain.image_count;
        let presenter = match &opts.output {
            Some(dir) => OffscreenPresenter::file_writer(&device, opts.size, image_count, dir)
                .with_context(|| format!("failed to create file writer at {}", dir.display()))?,
            None => OffscreenPresenter::new(&device, opts.size, image_count)?,
        };
        Self::new(device, DemoPresenter::Offscreen(presenter), opts.workers)
    }

    pub fn windowed(opts: &RenderOptions, target: SurfaceTarget) -> anyhow::Result<Self> {
        let display = match target {
            SurfaceTarget::Window { display, .. } => Some(display),
            SurfaceTarget::Headless { .. } => None,
        };
        let device = create_device(opts, display)?;
        let swapchain = Swapchain::new(&device, &target).context("failed to create swapchain")?;
        Self::new(device, DemoPresenter::Window(swapchain), opts.workers)
    }
}
// getters
impl FrameRunner {
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn scene(&self) -> &DemoScene {
        &self.scene
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    #[inline]
    pub fn last_frame(&self) -> Option<FrameIndex> {
        self.last_frame
    }

    pub fn summary(&self) -> RunSummary {
        let stats = self.device.stats();
        let elapsed = self.started.elapsed();
        let average_fps = if elapsed.is_zero() { 0.0 } else { self.frames_rendered as f32 / elapsed.as_secs_f32() };
        RunSummary {
            frames: self.frames_rendered,
            elapsed,
            average_fps,
            total_stall: stats.frames.total_stall,
            max_in_flight: stats.frames.max_in_flight,
        }
    }
}
// tools
impl FrameRunner {
    pub fn render_frame(&mut self) -> RhiResult<PresentStatus> {
        let _span = tracy_client::span!("FrameRunner::render_frame");
        let device = &self.device;

        let frame = device.begin_frame()?;
        let target = self.presenter.acquire(device, frame)?;
        let (time, delta_ms) = device.frame_timer(|timer| (timer.total_time().as_secs_f32(), timer.delta_time_ms()));
        let params = FrameParams::new(frame, time, delta_ms);

        let streams = self.scene.record_frame(device, frame, &params, &self.presenter, &target)?;
        let fence = device.submit_frame(frame, streams)?;
        let status = self.presenter.present(device, target, &fence)?;

        self.frames_rendered += 1;
        self.last_frame = Some(frame);
        if self.frames_rendered % 60 == 0 {
            let fps = device.frame_timer(|timer| timer.fps());
            log::info!("{}: {:.1} fps, {} in flight", device.frame_name(frame), fps, device.stats().in_flight);
        }
        if status != PresentStatus::Presented {
            log::debug!("{} present status {:?}", device.frame_name(frame), status);
        }
        Ok(status)
    }

    /// 渲染 frames 帧，返回统计
    pub fn run_frames(&mut self, frames: u64) -> RhiResult<RunSummary> {
        for _ in 0..frames {
            self.render_frame()?;
        }
        self.device.wait_idle()?;
        Ok(self.summary())
    }

    /// 窗口大小变化；大小为 0 时（最小化）不做任何事
    pub fn resize(&mut self, extent: Extent2d) -> RhiResult<()> {
        if extent.width == 0 || extent.height == 0 || extent == self.presenter.extent() {
            return Ok(());
        }
        self.device.wait_idle()?;
        self.presenter.resize(&self.device, extent)
    }
}
// destroy
impl FrameRunner {
    pub fn destroy(self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait idle before destroy failed: {}", e);
        }
        self.scene.destroy(&self.device);
        self.presenter.destroy(&self.device);
        if let Err(e) = self.device.wait_idle() {
            log::warn!("final wait idle failed: {}", e);
        }
        log::info!("frame runner destroyed after {} frames", self.frames_rendered);
    }
}

/// bench 模式以及没有窗口时的入口
pub fn run_offscreen(opts: &RenderOptions) -> anyhow::Result<RunSummary> {
    let mut runner = FrameRunner::offscreen(opts)?;
    let frames = opts.frame_limit().unwrap_or(opts.frames);
    let summary = runner.run_frames(frames).context("offscreen rendering failed")?;
    log::info!(
        "rendered {} frames in {:.2?}: {:.1} fps, stalled {:.2?}, max {} frames in flight",
        summary.frames,
        summary.elapsed,
        summary.average_fps,
        summary.total_stall,
        summary.max_in_flight
    );
    runner.destroy();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn headless_options(args: &[&str]) -> RenderOptions {
        let mut all = vec!["rhi-demo", "--backend", "headless", "--size", "16x8"];
        all.extend_from_slice(args);
        RenderOptions::try_parse_from(all).unwrap()
    }

    #[test]
    fn test_offscreen_frames() {
        let opts = headless_options(&["--mode", "frames", "--frames", "5", "--workers", "3"]);
        let mut runner = FrameRunner::offscreen(&opts).unwrap();
        let summary = runner.run_frames(5).unwrap();
        assert_eq!(summary.frames, 5);
        assert!(summary.max_in_flight <= runner.device().config().frames.frames_in_flight);

        // 最后一帧的参数已经经过 upload 和 copy 到达 history
        let last = runner.last_frame().unwrap();
        let params = runner.scene().read_history(runner.device(), last).unwrap();
        assert_eq!(params.frame, last.0 as u32);
        assert_eq!(params.clear_color.w, 1.0);
        runner.destroy();
    }

    #[test]
    fn test_file_writer_output() {
        let dir = std::env::temp_dir().join(format!("rhi-demo-test-{}", std::process::id()));
        let dir_str = dir.to_string_lossy().into_owned();
        let opts = headless_options(&["--mode", "frames", "--frames", "2", "--output", &dir_str]);

        let summary = run_offscreen(&opts).unwrap();
        assert_eq!(summary.frames, 2);
        let pngs = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
            .count();
        assert_eq!(pngs, 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_windowed_on_headless_backend() {
        let opts = headless_options(&["--workers", "1"]);
        let target = SurfaceTarget::headless(opts.size);
        let mut runner = FrameRunner::windowed(&opts, target).unwrap();

        assert_eq!(runner.render_frame().unwrap(), PresentStatus::Presented);
        runner.resize(Extent2d::new(32, 16)).unwrap();
        // 最小化时忽略
        runner.resize(Extent2d::new(0, 0)).unwrap();
        assert_eq!(runner.presenter.extent(), Extent2d::new(32, 16));
        runner.render_frame().unwrap();
        runner.destroy();
    }

    #[test]
    fn test_color_changes_over_time() {
        let a = FrameParams::color_at(0.0);
        let b = FrameParams::color_at(1.0);
        assert_ne!(a, b);
        for c in [a, b] {
            assert!(c.min_element() >= 0.0 && c.max_element() <= 1.0);
        }
    }
}
