//! 后端的能力接口
//!
//! RHI 的核心部分只通过这里的 trait 和后端交互：
//! - `GfxBackend`: 内存、对象、encoder、surface 的工厂
//! - `BackendQueue`: 带 timeline 的硬件 queue
//! - `CommandEncoder`: 把解析后的命令编码成后端的 command buffer
//! - `BackendSurface`: 可呈现的 image 的获取与呈现
//!
//! 每个后端实现一份，目前有 `headless`（CPU 模拟）和 `truvis-rhi-vulkan`。

pub mod headless;

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::command::{ClearValue, IndexType, LoadOp};
use crate::error::RhiResult;
use crate::queue::{QueueKind, TimelinePoint};
use crate::resource::desc::{
    BufferDesc, DescriptorType, Extent2d, ImageDesc, MemoryLocality, PipelineDesc, SamplerDesc,
};
use crate::resource::handles::ResourceType;
use crate::swapchain::{PresentMode, PresentStatus, SurfaceTarget};
use crate::sync::{ImageLayout, Scope};

/// 后端对象的 id，由后端分配
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// 后端的一块 device memory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMemoryId(pub u64);

/// 资源绑定到的内存区间
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryBinding {
    pub memory: DeviceMemoryId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: String,
    /// 后端提供的 queue，第一个是主 queue
    pub queues: Vec<QueueKind>,
    /// None 表示不限制
    pub device_local_budget: Option<u64>,
    pub host_visible_budget: Option<u64>,
}

impl BackendInfo {
    #[inline]
    pub fn primary_queue(&self) -> QueueKind {
        self.queues.first().copied().unwrap_or(QueueKind::Graphics)
    }

    #[inline]
    pub fn has_queue(&self, kind: QueueKind) -> bool {
        self.queues.contains(&kind)
    }
}

/// descriptor set 中解析后的一个 binding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedDescriptor {
    pub binding: u32,
    pub ty: DescriptorType,
    pub object: ObjectId,
    pub sampler: Option<ObjectId>,
}

/// 创建后端对象所需的描述
#[derive(Clone, Copy, Debug)]
pub enum ObjectDesc<'a> {
    Buffer(&'a BufferDesc),
    Image(&'a ImageDesc),
    Sampler(&'a SamplerDesc),
    Pipeline(&'a PipelineDesc),
    DescriptorSet(&'a [ResolvedDescriptor]),
}

impl ObjectDesc<'_> {
    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ObjectDesc::Buffer(_) => ResourceType::Buffer,
            ObjectDesc::Image(_) => ResourceType::Image,
            ObjectDesc::Sampler(_) => ResourceType::Sampler,
            ObjectDesc::Pipeline(_) => ResourceType::Pipeline,
            ObjectDesc::DescriptorSet(_) => ResourceType::DescriptorSet,
        }
    }
}

/// 解析成后端对象之后的 barrier
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedBarrier {
    pub object: ObjectId,
    pub resource_type: ResourceType,
    pub src: Scope,
    pub dst: Scope,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub range: Option<Range<u64>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedAttachment {
    pub image: ObjectId,
    pub load: LoadOp,
    pub store: bool,
}

/// 句柄已经替换成后端对象的命令
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedCommand {
    BindPipeline {
        pipeline: ObjectId,
        compute: bool,
    },
    BindDescriptorSet {
        set_index: u32,
        set: ObjectId,
        compute: bool,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: ObjectId,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: ObjectId,
        offset: u64,
        index_type: IndexType,
    },
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    BeginRendering {
        extent: Extent2d,
        color: Vec<ResolvedAttachment>,
        depth: Option<ResolvedAttachment>,
    },
    EndRendering,
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        vertex_offset: i32,
        instances: Range<u32>,
    },
    Dispatch {
        groups: [u32; 3],
    },
    CopyBuffer {
        src: ObjectId,
        src_offset: u64,
        dst: ObjectId,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: ObjectId,
        src_offset: u64,
        dst: ObjectId,
    },
    CopyImageToBuffer {
        src: ObjectId,
        dst: ObjectId,
        dst_offset: u64,
    },
    FillBuffer {
        dst: ObjectId,
        offset: u64,
        size: u64,
        value: u32,
    },
    ClearImage {
        image: ObjectId,
        value: ClearValue,
    },
    Barrier(ResolvedBarrier),
    /// 让之前的写入对 host 可见
    HostBarrier,
    BeginLabel(String),
    EndLabel,
}

impl ResolvedCommand {
    /// 用于日志和调试 trace
    pub fn name(&self) -> &'static str {
        match self {
            ResolvedCommand::BindPipeline { .. } => "bind_pipeline",
            ResolvedCommand::BindDescriptorSet { .. } => "bind_descriptor_set",
            ResolvedCommand::BindVertexBuffer { .. } => "bind_vertex_buffer",
            ResolvedCommand::BindIndexBuffer { .. } => "bind_index_buffer",
            ResolvedCommand::PushConstants { .. } => "push_constants",
            ResolvedCommand::BeginRendering { .. } => "begin_rendering",
            ResolvedCommand::EndRendering => "end_rendering",
            ResolvedCommand::Draw { .. } => "draw",
            ResolvedCommand::DrawIndexed { .. } => "draw_indexed",
            ResolvedCommand::Dispatch { .. } => "dispatch",
            ResolvedCommand::CopyBuffer { .. } => "copy_buffer",
            ResolvedCommand::CopyBufferToImage { .. } => "copy_buffer_to_image",
            ResolvedCommand::CopyImageToBuffer { .. } => "copy_image_to_buffer",
            ResolvedCommand::FillBuffer { .. } => "fill_buffer",
            ResolvedCommand::ClearImage { .. } => "clear_image",
            ResolvedCommand::Barrier(_) => "barrier",
            ResolvedCommand::HostBarrier => "host_barrier",
            ResolvedCommand::BeginLabel(_) => "begin_label",
            ResolvedCommand::EndLabel => "end_label",
        }
    }
}

/// 后端编码完成的命令，只有创建它的后端知道里面是什么
pub struct EncodedCommands(Box<dyn Any + Send>);

impl EncodedCommands {
    #[inline]
    pub fn new<T: Any + Send>(commands: T) -> Self {
        Self(Box::new(commands))
    }

    #[inline]
    pub fn downcast<T: Any + Send>(self) -> Result<T, Self> {
        self.0.downcast::<T>().map(|b| *b).map_err(Self)
    }
}

impl fmt::Debug for EncodedCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncodedCommands")
    }
}

/// 一次 queue 提交
///
/// commands 为 None 时只做等待和 signal。
#[derive(Debug)]
pub struct SubmitBatch {
    pub commands: Option<EncodedCommands>,
    pub waits: Vec<TimelinePoint>,
    pub signal: u64,
    pub label: String,
}

pub trait BackendQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    /// 提交一批命令，执行完成后 timeline 到达 `batch.signal`
    fn submit(&self, batch: SubmitBatch) -> RhiResult<()>;

    /// timeline 当前已经到达的值
    fn completed_value(&self) -> u64;

    /// 等待 timeline 到达 value；超时返回 Ok(false)，设备丢失返回 `DeviceLost`
    fn wait_value(&self, value: u64, timeout: Duration) -> RhiResult<bool>;
}

pub trait CommandEncoder: Send {
    fn encode(&mut self, command: &ResolvedCommand) -> RhiResult<()>;

    fn finish(self: Box<Self>) -> RhiResult<EncodedCommands>;
}

/// surface 创建出来的一张 image
#[derive(Clone, Debug, PartialEq)]
pub struct SurfaceImage {
    pub object: ObjectId,
    pub desc: ImageDesc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

pub trait BackendSurface: Send {
    /// 重新创建可呈现的 image，旧的 image 由调用者保证不再被使用
    fn configure(&mut self, extent: Extent2d, present_mode: PresentMode, image_count: u32)
    -> RhiResult<Vec<SurfaceImage>>;

    fn acquire(&mut self, timeout: Duration) -> RhiResult<AcquireOutcome>;

    /// 在 `wait` 全部到达之后呈现第 index 张 image
    fn present(&mut self, index: u32, wait: &[TimelinePoint]) -> RhiResult<PresentStatus>;
}

pub trait GfxBackend: Send + Sync + 'static {
    fn info(&self) -> &BackendInfo;

    fn queue(&self, kind: QueueKind) -> Option<Arc<dyn BackendQueue>>;

    // memory
    fn allocate_memory(&self, locality: MemoryLocality, size: u64) -> RhiResult<DeviceMemoryId>;
    fn free_memory(&self, memory: DeviceMemoryId);
    fn write_memory(&self, memory: DeviceMemoryId, offset: u64, data: &[u8]) -> RhiResult<()>;
    fn read_memory(&self, memory: DeviceMemoryId, offset: u64, out: &mut [u8]) -> RhiResult<()>;
    fn memory_requirements(&self, desc: ObjectDesc<'_>) -> RhiResult<MemoryRequirements>;

    // objects
    fn create_object(&self, desc: ObjectDesc<'_>, memory: Option<MemoryBinding>) -> RhiResult<ObjectId>;
    fn destroy_object(&self, object: ObjectId);

    // commands
    /// slot 是帧槽位，encoder 的 command buffer 从该槽位的 pool 中分配
    fn create_encoder(&self, queue: QueueKind, slot: usize) -> RhiResult<Box<dyn CommandEncoder>>;
    /// 槽位的 fence 已经完成，回收它的所有 command buffer
    fn reset_command_pools(&self, slot: usize) -> RhiResult<()>;

    fn create_surface(&self, target: &SurfaceTarget) -> RhiResult<Box<dyn BackendSurface>>;

    fn wait_idle(&self) -> RhiResult<()>;
}
