use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use truvis_crate_tools::resource::TruvisPath;
use truvis_rhi::resource::desc::Extent2d;
use truvis_rhi::{PresentMode, RhiConfig};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// 打开窗口，直到窗口关闭
    #[default]
    Default,
    /// 渲染固定数量的帧之后退出
    Frames,
    /// 离屏渲染固定数量的帧，输出帧率统计
    Bench,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// CPU 模拟的后端
    Headless,
    #[default]
    Vulkan,
}

/// 渲染选项
#[derive(Clone, Debug, Parser)]
#[command(name = "rhi-demo", version, about = "truvis-rhi demo: multi-threaded recording and presentation")]
pub struct RenderOptions {
    #[arg(long, value_enum, default_value_t = RunMode::Default)]
    pub mode: RunMode,

    /// frames 和 bench 模式下渲染的帧数
    #[arg(long, default_value_t = 120)]
    pub frames: u64,

    /// 窗口或者离屏 image 的大小，例如 1280x720
    #[arg(long, default_value = "1200x800", value_parser = parse_extent)]
    pub size: Extent2d,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub vsync: bool,

    /// 把每一帧写成 png，只在没有窗口时生效
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = BackendKind::Vulkan)]
    pub backend: BackendKind,

    /// RHI 配置文件（toml），默认读取 `config/rhi.toml`
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub frames_in_flight: Option<usize>,

    /// 每帧参与录制的 worker 线程数
    #[arg(long, default_value_t = 2)]
    pub workers: usize,
}

impl RenderOptions {
    /// frames 和 bench 模式有帧数上限
    #[inline]
    pub fn frame_limit(&self) -> Option<u64> {
        match self.mode {
            RunMode::Default => None,
            RunMode::Frames | RunMode::Bench => Some(self.frames),
        }
    }

    /// bench 模式总是离屏渲染
    #[inline]
    pub fn windowed(&self) -> bool {
        self.mode != RunMode::Bench
    }

    /// 配置文件加上命令行的覆盖
    pub fn rhi_config(&self) -> anyhow::Result<RhiConfig> {
        let path = self.config.clone().unwrap_or_else(|| TruvisPath::config_path("rhi.toml"));
        let mut config = RhiConfig::load(&path)?;
        if let Some(frames_in_flight) = self.frames_in_flight {
            config = config.with_frames_in_flight(frames_in_flight);
        }
        config.swapchain.present_mode = PresentMode::from_vsync(self.vsync);
        config.validate()?;
        Ok(config)
    }
}

fn parse_extent(s: &str) -> Result<Extent2d, String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{s}`"))?;
    let width: u32 = width.trim().parse().map_err(|e| format!("invalid width `{width}`: {e}"))?;
    let height: u32 = height.trim().parse().map_err(|e| format!("invalid height `{height}`: {e}"))?;
    if width == 0 || height == 0 {
        return Err(format!("extent must not be empty, got {width}x{height}"));
    }
    Ok(Extent2d::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extent() {
        assert_eq!(parse_extent("1280x720").unwrap(), Extent2d::new(1280, 720));
        assert_eq!(parse_extent("64X32").unwrap(), Extent2d::new(64, 32));
        assert!(parse_extent("1280").is_err());
        assert!(parse_extent("0x720").is_err());
        assert!(parse_extent("axb").is_err());
    }

    #[test]
    fn test_default_options() {
        let opts = RenderOptions::try_parse_from(["rhi-demo"]).unwrap();
        assert_eq!(opts.mode, RunMode::Default);
        assert_eq!(opts.backend, BackendKind::Vulkan);
        assert_eq!(opts.size, Extent2d::new(1200, 800));
        assert!(opts.vsync);
        assert_eq!(opts.frame_limit(), None);
        assert!(opts.windowed());
    }

    #[test]
    fn test_bench_options() {
        let opts = RenderOptions::try_parse_from([
            "rhi-demo",
            "--mode",
            "bench",
            "--frames",
            "30",
            "--backend",
            "headless",
            "--vsync",
            "false",
            "--frames-in-flight",
            "3",
        ])
        .unwrap();
        assert_eq!(opts.frame_limit(), Some(30));
        assert!(!opts.windowed());

        let config = opts.rhi_config().unwrap();
        assert_eq!(config.frames.frames_in_flight, 3);
        assert_eq!(config.swapchain.present_mode, PresentMode::Mailbox);
    }

    #[test]
    fn test_missing_config_file() {
        let opts = RenderOptions::try_parse_from(["rhi-demo", "--config", "no-such-dir/rhi.toml"]).unwrap();
        assert_eq!(opts.rhi_config().unwrap().frames.frames_in_flight, RhiConfig::default().frames.frames_in_flight);
    }

    #[test]
    fn test_invalid_frames_in_flight() {
        let opts = RenderOptions::try_parse_from(["rhi-demo", "--frames-in-flight", "0"]).unwrap();
        assert!(opts.rhi_config().is_err());
    }
}
