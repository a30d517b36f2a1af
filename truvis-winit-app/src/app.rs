use anyhow::Context;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use truvis_rhi::resource::desc::Extent2d;
use truvis_rhi::swapchain::SurfaceTarget;
use truvis_rhi::{PresentStatus, RhiError};
use winit::window::Window;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};

use crate::cli::RenderOptions;
use crate::frame_loop::FrameRunner;

pub fn panic_handler(info: &std::panic::PanicHookInfo) {
    log::error!("{}", info);
}

pub struct WinitApp {
    opts: RenderOptions,
    runner: Option<FrameRunner>,
    window: Option<Window>,

    /// 事件循环中出现的第一个错误，退出之后返回给调用者
    error: Option<anyhow::Error>,
}
// 总的 main 函数
impl WinitApp {
    pub fn init_env() {
        std::panic::set_hook(Box::new(panic_handler));
        truvis_crate_tools::init_log::init_log();

        tracy_client::Client::start();
        tracy_client::set_thread_name!("RenderThread");
    }

    /// 打开窗口并运行帧循环，直到窗口关闭或者达到帧数上限
    pub fn run(opts: RenderOptions) -> anyhow::Result<()> {
        let event_loop = EventLoop::new().context("failed to create event loop")?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut app = Self {
            opts,
            runner: None,
            window: None,
            error: None,
        };
        event_loop.run_app(&mut app).context("event loop failed")?;
        log::info!("end run.");

        let error = app.error.take();
        app.destroy();
        error.map_or(Ok(()), Err)
    }
}
// new & init
impl WinitApp {
    /// 在 window 创建之后调用，初始化 Device 和 swapchain
    fn init_after_window(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let size = self.opts.size;
        let window_attr = Window::default_attributes()
            .with_title(format!("Truvis RHI ({:?})", self.opts.backend))
            .with_inner_size(winit::dpi::PhysicalSize::new(size.width, size.height));
        let window = event_loop.create_window(window_attr).context("failed to create window")?;

        let inner = window.inner_size();
        let target = SurfaceTarget::Window {
            display: window.display_handle()?.as_raw(),
            window: window.window_handle()?.as_raw(),
            extent: Extent2d::new(inner.width.max(1), inner.height.max(1)),
        };
        self.runner = Some(FrameRunner::windowed(&self.opts, target)?);
        self.window = Some(window);
        Ok(())
    }
}
// tools
impl WinitApp {
    fn redraw(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let Some(runner) = self.runner.as_mut() else {
            return Ok(());
        };
        match runner.render_frame() {
            Ok(PresentStatus::OutOfDate) => {
                if let Some(window) = &self.window {
                    let size = window.inner_size();
                    runner.resize(Extent2d::new(size.width, size.height))?;
                }
            }
            Ok(_) => {}
            // 窗口正在变化，下一次 redraw 再试
            Err(RhiError::Surface(msg)) => log::warn!("skip frame: {}", msg),
            Err(e) => return Err(e.into()),
        }

        if self.opts.frame_limit().is_some_and(|limit| runner.frames_rendered() >= limit) {
            log::info!("frame limit reached");
            event_loop.exit();
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }
}
// destroy
impl WinitApp {
    fn destroy(&mut self) {
        // swapchain 必须在 window 之前销毁
        if let Some(runner) = self.runner.take() {
            runner.destroy();
        }
        self.window = None;
    }
}
// 各种 winit 的事件处理
impl ApplicationHandler for WinitApp {
    // 建议在这里创建 window 和 Renderer
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        log::info!("winit event: resumed");
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init_after_window(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        let result = match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
                Ok(())
            }
            WindowEvent::Resized(size) => match self.runner.as_mut() {
                Some(runner) => runner.resize(Extent2d::new(size.width, size.height)).map_err(anyhow::Error::from),
                None => Ok(()),
            },
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        log::warn!("winit event: suspended");
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!("loop exiting");
        self.destroy();
    }
}
