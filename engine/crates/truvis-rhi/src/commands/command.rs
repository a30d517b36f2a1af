use std::ops::Range;

use crate::resource::desc::Extent2d;
use crate::resource::handles::{BufferHandle, DescriptorSetHandle, ImageHandle, PipelineHandle};
use crate::sync::BarrierRequest;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp {
    Load,
    Clear(ClearValue),
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    #[inline]
    pub const fn size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Attachment {
    pub image: ImageHandle,
    pub load: LoadOp,
    pub store: bool,
}

impl Attachment {
    #[inline]
    pub fn clear(image: ImageHandle, value: ClearValue) -> Self {
        Self {
            image,
            load: LoadOp::Clear(value),
            store: true,
        }
    }

    #[inline]
    pub fn load(image: ImageHandle) -> Self {
        Self {
            image,
            load: LoadOp::Load,
            store: true,
        }
    }
}

/// dynamic rendering 的参数
#[derive(Clone, Debug, PartialEq)]
pub struct RenderingInfo {
    pub extent: Extent2d,
    pub color: Vec<Attachment>,
    pub depth: Option<Attachment>,
}

/// CommandStream 中记录的一条命令
///
/// 资源都以句柄的形式记录，提交时才解析成后端对象。
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BindPipeline(PipelineHandle),
    BindDescriptorSet {
        set_index: u32,
        set: DescriptorSetHandle,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    },
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    BeginRendering(RenderingInfo),
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
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    /// 整个 base mip level
    CopyBufferToImage {
        src: BufferHandle,
        src_offset: u64,
        dst: ImageHandle,
    },
    CopyImageToBuffer {
        src: ImageHandle,
        dst: BufferHandle,
        dst_offset: u64,
    },
    FillBuffer {
        dst: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    },
    ClearImage {
        image: ImageHandle,
        value: ClearValue,
    },
    /// 同一个 stream 内由访问冲突推导出的 barrier
    Barrier(BarrierRequest),
    BeginLabel(String),
    EndLabel,
}

impl Command {
    #[inline]
    pub fn is_barrier(&self) -> bool {
        matches!(self, Command::Barrier(_))
    }
}
