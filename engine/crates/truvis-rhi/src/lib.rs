//! 与后端无关的渲染硬件接口
//!
//! 应用通过 `Device` 创建资源、获取 recorder 录制命令、提交一帧，不直接接触具体的图形 API。
//! RHI 负责：
//!
//! - 资源的生命周期：句柄带有 generation，销毁之后在 GPU 用完之前不会真正回收
//! - 多帧并行：最多 N 帧同时在 GPU 上执行，第 N+1 帧会等待最早的一帧完成
//! - 同步：根据每个 stream 声明的资源访问推导 barrier 和 queue 之间的等待
//! - 多线程录制：每个 worker 每帧一个 recorder，提交时按调用者给定的顺序合并
//!
//! # 帧循环
//! ```ignore
//! let frame = device.begin_frame()?;
//! let mut recorder = device.acquire_recorder(frame, WorkerId::current(), QueueKind::Graphics)?;
//! let mut session = recorder.begin(frame)?;
//! session.fill_buffer(buffer, 0, 256, 0)?;
//! let stream = session.end()?;
//! let fence = device.submit_frame(frame, vec![stream])?;
//! ```
//!
//! 后端实现 `backend::GfxBackend`，`backend::headless` 是 CPU 模拟的后端。

pub mod allocator;
pub mod backend;
pub mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod profiling;
pub mod queue;
pub mod resource;
pub mod scheduler;
pub mod swapchain;
pub mod sync;

pub use commands::{CommandRecorder, CommandStream, RecordingSession, WorkerId};
pub use config::RhiConfig;
pub use device::{Device, DeviceStats};
pub use error::{RhiError, RhiResult};
pub use frame::{Fence, FrameIndex};
pub use queue::{QueueKind, TimelinePoint};
pub use resource::{BufferHandle, DescriptorSetHandle, Handle, ImageHandle, PipelineHandle, SamplerHandle};
pub use scheduler::{SegmentReport, SubmissionReport};
pub use swapchain::{OffscreenPresenter, PresentMode, PresentStatus, PresentTarget, Presenter, Swapchain};
pub use sync::{AccessDeclaration, AccessKind, PipelineStages, SyncGranularity};
