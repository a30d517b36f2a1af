//! GPU 资源：句柄、描述符和资源表

pub mod desc;
pub mod handles;
pub mod table;

use crate::allocator::MemoryBlock;
use crate::backend::ObjectId;
use crate::frame::FrameIndex;
use crate::resource::desc::{BufferDesc, DescriptorSetDesc, ImageDesc, MemoryLocality, PipelineDesc, SamplerDesc};
use crate::resource::handles::ResourceType;
use crate::sync::graph::ResourceSyncState;

pub use handles::{
    BufferHandle, DescriptorSetHandle, Handle, ImageHandle, PipelineHandle, RawHandle, ResourceKind, SamplerHandle,
};
pub use table::ResourceTable;

/// 资源的元数据
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceData {
    Buffer(BufferDesc),
    Image(ImageDesc),
    Sampler(SamplerDesc),
    Pipeline(PipelineDesc),
    DescriptorSet(DescriptorSetDesc),
}

impl ResourceData {
    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceData::Buffer(_) => ResourceType::Buffer,
            ResourceData::Image(_) => ResourceType::Image,
            ResourceData::Sampler(_) => ResourceType::Sampler,
            ResourceData::Pipeline(_) => ResourceType::Pipeline,
            ResourceData::DescriptorSet(_) => ResourceType::DescriptorSet,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ResourceData::Buffer(desc) => &desc.label,
            ResourceData::Image(desc) => &desc.label,
            ResourceData::Sampler(desc) => &desc.label,
            ResourceData::Pipeline(desc) => &desc.label,
            ResourceData::DescriptorSet(desc) => &desc.label,
        }
    }
}

/// 资源最近一次被使用的方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UsageState {
    #[default]
    Undefined,
    ReadOnly,
    Write,
    Presenting,
}

/// 资源表中的一项
///
/// 只由 ResourceTable 持有，其他地方都通过句柄访问。
#[derive(Debug)]
pub struct Resource {
    pub data: ResourceData,
    pub object: ObjectId,
    pub memory: Option<MemoryBlock>,

    pub usage: UsageState,
    /// 最近一次引用它的帧，单调递增
    pub last_used: Option<FrameIndex>,
    /// 上一帧结束时的同步状态
    pub sync: ResourceSyncState,

    /// 已经调用过 destroy，等待回收
    pub pending_destroy: bool,
    /// 由 surface 持有的 image，回收时不销毁后端对象
    pub external: bool,
}
// new & init
impl Resource {
    pub fn new(data: ResourceData, object: ObjectId, memory: Option<MemoryBlock>) -> Self {
        Self {
            data,
            object,
            memory,
            usage: UsageState::Undefined,
            last_used: None,
            sync: ResourceSyncState::default(),
            pending_destroy: false,
            external: false,
        }
    }

    #[inline]
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }
}
// getters
impl Resource {
    #[inline]
    pub fn label(&self) -> &str {
        self.data.label()
    }

    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        self.data.resource_type()
    }

    #[inline]
    pub fn as_buffer(&self) -> Option<&BufferDesc> {
        match &self.data {
            ResourceData::Buffer(desc) => Some(desc),
            _ => None,
        }
    }

    #[inline]
    pub fn as_image(&self) -> Option<&ImageDesc> {
        match &self.data {
            ResourceData::Image(desc) => Some(desc),
            _ => None,
        }
    }

    #[inline]
    pub fn as_pipeline(&self) -> Option<&PipelineDesc> {
        match &self.data {
            ResourceData::Pipeline(desc) => Some(desc),
            _ => None,
        }
    }

    #[inline]
    pub fn as_descriptor_set(&self) -> Option<&DescriptorSetDesc> {
        match &self.data {
            ResourceData::DescriptorSet(desc) => Some(desc),
            _ => None,
        }
    }

    #[inline]
    pub fn is_host_visible(&self) -> bool {
        matches!(&self.data, ResourceData::Buffer(desc) if desc.locality == MemoryLocality::HostVisible)
    }

    /// 资源是否可以在 `completed` 完成之后回收
    #[inline]
    pub fn is_retired(&self, completed: Option<FrameIndex>) -> bool {
        match (self.last_used, completed) {
            (None, _) => true,
            (Some(used), Some(completed)) => used <= completed,
            (Some(_), None) => false,
        }
    }

    #[inline]
    pub fn stamp(&mut self, frame: FrameIndex) {
        self.last_used = Some(self.last_used.map_or(frame, |used| used.max(frame)));
    }
}
