//! truvis-rhi 的演示程序
//!
//! 每一帧由多个 worker 线程并行录制 stream，调用线程负责提交和呈现。
//! 有窗口时通过 swapchain 呈现，bench 模式离屏渲染，可以把每一帧写成 png。

pub mod app;
pub mod cli;
pub mod frame_loop;
pub mod scene;
