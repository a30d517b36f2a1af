//! 资源的创建参数
//!
//! 所有描述符在创建资源之前都会经过 `validate`，不合法时返回 `InvalidDescriptor`。

use bitflags::bitflags;

use crate::error::{RhiError, RhiResult};
use crate::resource::handles::{BufferHandle, ImageHandle, SamplerHandle};
use crate::sync::PipelineStages;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

/// 内存的位置类别
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryLocality {
    /// 只有 GPU 可以访问，速度最快
    #[default]
    DeviceLocal,
    /// CPU 可以直接读写（staging、readback、频繁更新的 uniform）
    HostVisible,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    /// 每个 texel 的字节数
    pub const fn texel_size(self) -> u64 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float | Format::D16Unorm => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    #[inline]
    pub const fn is_depth(self) -> bool {
        matches!(self, Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint)
    }

    #[inline]
    pub const fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    #[inline]
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    #[inline]
    pub const fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }
}

impl From<Extent2d> for Extent3d {
    fn from(e: Extent2d) -> Self {
        Self::new_2d(e.width, e.height)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageDimension {
    D1,
    #[default]
    D2,
    D3,
}

// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub locality: MemoryLocality,
    pub label: String,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage, locality: MemoryLocality, label: impl Into<String>) -> Self {
        Self {
            size,
            usage,
            locality,
            label: label.into(),
        }
    }

    pub fn validate(&self) -> RhiResult<()> {
        if self.size == 0 {
            return Err(RhiError::invalid_descriptor(&self.label, "buffer size must be greater than 0"));
        }
        if self.usage.is_empty() {
            return Err(RhiError::invalid_descriptor(&self.label, "buffer usage is empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageDesc {
    pub dimension: ImageDimension,
    pub extent: Extent3d,
    pub format: Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub usage: ImageUsage,
    pub label: String,
}

impl ImageDesc {
    pub fn new_2d(width: u32, height: u32, format: Format, usage: ImageUsage, label: impl Into<String>) -> Self {
        Self {
            dimension: ImageDimension::D2,
            extent: Extent3d::new_2d(width, height),
            format,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage,
            label: label.into(),
        }
    }

    /// mip 0 所有 layer 的字节数，也是 buffer <-> image 拷贝的大小
    #[inline]
    pub fn base_level_size(&self) -> u64 {
        self.extent.texel_count() * self.array_layers as u64 * self.format.texel_size()
    }

    /// 所有 mip 所需的字节数
    pub fn total_size(&self) -> u64 {
        let mut size = 0;
        let mut extent = self.extent;
        for _ in 0..self.mip_levels {
            size += extent.texel_count() * self.array_layers as u64 * self.format.texel_size();
            extent = Extent3d {
                width: (extent.width / 2).max(1),
                height: (extent.height / 2).max(1),
                depth: (extent.depth / 2).max(1),
            };
        }
        size
    }

    pub fn validate(&self) -> RhiResult<()> {
        let e = &self.extent;
        if e.width == 0 || e.height == 0 || e.depth == 0 {
            return Err(RhiError::invalid_descriptor(&self.label, "image extent must be non-zero"));
        }
        match self.dimension {
            ImageDimension::D1 if e.height != 1 || e.depth != 1 => {
                return Err(RhiError::invalid_descriptor(&self.label, "1d image must have height = depth = 1"));
            }
            ImageDimension::D2 if e.depth != 1 => {
                return Err(RhiError::invalid_descriptor(&self.label, "2d image must have depth = 1"));
            }
            _ => {}
        }
        if self.array_layers == 0 {
            return Err(RhiError::invalid_descriptor(&self.label, "array_layers must be greater than 0"));
        }
        let max_mips = 32 - e.width.max(e.height).max(e.depth).leading_zeros();
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return Err(RhiError::invalid_descriptor(
                &self.label,
                format!("mip_levels must be in 1..={max_mips}, got {}", self.mip_levels),
            ));
        }
        if !self.samples.is_power_of_two() || self.samples > 64 {
            return Err(RhiError::invalid_descriptor(&self.label, format!("invalid sample count {}", self.samples)));
        }
        if self.usage.is_empty() {
            return Err(RhiError::invalid_descriptor(&self.label, "image usage is empty"));
        }
        if self.format.is_depth() && self.usage.intersects(ImageUsage::COLOR_ATTACHMENT | ImageUsage::STORAGE) {
            return Err(RhiError::invalid_descriptor(
                &self.label,
                "depth format can not be used as color attachment or storage image",
            ));
        }
        if !self.format.is_depth() && self.usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
            return Err(RhiError::invalid_descriptor(&self.label, "depth attachment requires a depth format"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: Option<f32>,
    pub label: String,
}

impl SamplerDesc {
    pub fn new(filter: Filter, address_mode: AddressMode, label: impl Into<String>) -> Self {
        Self {
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: filter,
            address_mode,
            max_anisotropy: None,
            label: label.into(),
        }
    }

    pub fn validate(&self) -> RhiResult<()> {
        if let Some(anisotropy) = self.max_anisotropy {
            if !(1.0..=16.0).contains(&anisotropy) {
                return Err(RhiError::invalid_descriptor(
                    &self.label,
                    format!("max_anisotropy must be in [1, 16], got {anisotropy}"),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// shader 代码，由外部编译好（SPIR-V 或后端可以识别的其他格式）
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderDesc {
    pub stage: PipelineStages,
    pub entry_point: String,
    pub code: Vec<u8>,
}

impl ShaderDesc {
    pub fn new(stage: PipelineStages, entry_point: impl Into<String>, code: Vec<u8>) -> Self {
        Self {
            stage,
            entry_point: entry_point.into(),
            code,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorLayoutBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub stages: PipelineStages,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptorSetLayout {
    pub bindings: Vec<DescriptorLayoutBinding>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineKind {
    Graphics {
        vertex: ShaderDesc,
        fragment: Option<ShaderDesc>,
        vertex_layouts: Vec<VertexLayout>,
        topology: PrimitiveTopology,
        color_formats: Vec<Format>,
        depth_format: Option<Format>,
    },
    Compute {
        shader: ShaderDesc,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineDesc {
    pub kind: PipelineKind,
    pub set_layouts: Vec<DescriptorSetLayout>,
    pub push_constant_size: u32,
    pub label: String,
}

impl PipelineDesc {
    /// push constant 的上限，和 Vulkan 的最小保证保持一致
    pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;

    pub fn compute(shader: ShaderDesc, label: impl Into<String>) -> Self {
        Self {
            kind: PipelineKind::Compute { shader },
            set_layouts: Vec::new(),
            push_constant_size: 0,
            label: label.into(),
        }
    }

    #[inline]
    pub fn is_compute(&self) -> bool {
        matches!(self.kind, PipelineKind::Compute { .. })
    }

    pub fn validate(&self) -> RhiResult<()> {
        let label = &self.label;
        let check_shader = |shader: &ShaderDesc, stage: PipelineStages| -> RhiResult<()> {
            if shader.stage != stage {
                return Err(RhiError::invalid_descriptor(
                    label,
                    format!("expected a {stage:?} shader, got {:?}", shader.stage),
                ));
            }
            if shader.code.is_empty() {
                return Err(RhiError::invalid_descriptor(label, "shader code is empty"));
            }
            if shader.entry_point.is_empty() {
                return Err(RhiError::invalid_descriptor(label, "shader entry point is empty"));
            }
            Ok(())
        };

        match &self.kind {
            PipelineKind::Graphics {
                vertex,
                fragment,
                vertex_layouts,
                color_formats,
                depth_format,
                ..
            } => {
                check_shader(vertex, PipelineStages::VERTEX_SHADER)?;
                if let Some(fragment) = fragment {
                    check_shader(fragment, PipelineStages::FRAGMENT_SHADER)?;
                }
                if color_formats.iter().any(|f| f.is_depth()) {
                    return Err(RhiError::invalid_descriptor(label, "color attachment with depth format"));
                }
                if depth_format.is_some_and(|f| !f.is_depth()) {
                    return Err(RhiError::invalid_descriptor(label, "depth attachment with color format"));
                }
                if color_formats.is_empty() && depth_format.is_none() {
                    return Err(RhiError::invalid_descriptor(label, "graphics pipeline without attachments"));
                }
                for layout in vertex_layouts {
                    if layout.stride == 0 {
                        return Err(RhiError::invalid_descriptor(label, "vertex stride must be greater than 0"));
                    }
                    for attr in &layout.attributes {
                        if attr.offset as u64 + attr.format.texel_size() > layout.stride as u64 {
                            return Err(RhiError::invalid_descriptor(
                                label,
                                format!("vertex attribute {} exceeds stride", attr.location),
                            ));
                        }
                    }
                }
            }
            PipelineKind::Compute { shader } => check_shader(shader, PipelineStages::COMPUTE_SHADER)?,
        }

        if self.push_constant_size > Self::MAX_PUSH_CONSTANT_SIZE || self.push_constant_size % 4 != 0 {
            return Err(RhiError::invalid_descriptor(
                label,
                format!("invalid push constant size {}", self.push_constant_size),
            ));
        }
        for layout in &self.set_layouts {
            let mut bindings: Vec<u32> = layout.bindings.iter().map(|b| b.binding).collect();
            bindings.sort_unstable();
            bindings.dedup();
            if bindings.len() != layout.bindings.len() {
                return Err(RhiError::invalid_descriptor(label, "duplicate binding in set layout"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// descriptor set 中某个 binding 指向的资源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    UniformBuffer(BufferHandle),
    StorageBuffer { buffer: BufferHandle, writable: bool },
    SampledImage { image: ImageHandle, sampler: SamplerHandle },
    StorageImage { image: ImageHandle, writable: bool },
}

impl DescriptorResource {
    #[inline]
    pub fn ty(&self) -> DescriptorType {
        match self {
            DescriptorResource::UniformBuffer(_) => DescriptorType::UniformBuffer,
            DescriptorResource::StorageBuffer { .. } => DescriptorType::StorageBuffer,
            DescriptorResource::SampledImage { .. } => DescriptorType::SampledImage,
            DescriptorResource::StorageImage { .. } => DescriptorType::StorageImage,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub resource: DescriptorResource,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorSetDesc {
    pub bindings: Vec<DescriptorBinding>,
    pub label: String,
}

impl DescriptorSetDesc {
    pub fn new(bindings: Vec<DescriptorBinding>, label: impl Into<String>) -> Self {
        Self {
            bindings,
            label: label.into(),
        }
    }

    /// 只检查描述符本身，引用的资源是否存活由 Device 检查
    pub fn validate(&self) -> RhiResult<()> {
        if self.bindings.is_empty() {
            return Err(RhiError::invalid_descriptor(&self.label, "descriptor set without bindings"));
        }
        let mut slots: Vec<u32> = self.bindings.iter().map(|b| b.binding).collect();
        slots.sort_unstable();
        slots.dedup();
        if slots.len() != self.bindings.len() {
            return Err(RhiError::invalid_descriptor(&self.label, "duplicate binding index"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_desc_validation() {
        let ok = BufferDesc::new(256, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "ok");
        assert!(ok.validate().is_ok());

        let zero = BufferDesc::new(0, BufferUsage::STORAGE, MemoryLocality::DeviceLocal, "zero");
        assert!(matches!(zero.validate(), Err(RhiError::InvalidDescriptor(_))));

        let no_usage = BufferDesc::new(16, BufferUsage::empty(), MemoryLocality::DeviceLocal, "no-usage");
        assert!(matches!(no_usage.validate(), Err(RhiError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_image_desc_validation() {
        let ok = ImageDesc::new_2d(64, 64, Format::Rgba8Unorm, ImageUsage::SAMPLED, "ok");
        assert!(ok.validate().is_ok());
        assert_eq!(ok.base_level_size(), 64 * 64 * 4);

        let mut too_many_mips = ok.clone();
        too_many_mips.mip_levels = 8;
        assert!(too_many_mips.validate().is_err());
        too_many_mips.mip_levels = 7;
        assert!(too_many_mips.validate().is_ok());

        let depth_as_color =
            ImageDesc::new_2d(16, 16, Format::D32Float, ImageUsage::COLOR_ATTACHMENT, "depth-as-color");
        assert!(depth_as_color.validate().is_err());

        let empty = ImageDesc::new_2d(0, 16, Format::Rgba8Unorm, ImageUsage::SAMPLED, "empty");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_mip_chain_size() {
        let mut desc = ImageDesc::new_2d(4, 4, Format::R8Unorm, ImageUsage::SAMPLED, "mips");
        desc.mip_levels = 3;
        assert_eq!(desc.total_size(), 16 + 4 + 1);
    }

    #[test]
    fn test_pipeline_desc_validation() {
        let shader = ShaderDesc::new(PipelineStages::COMPUTE_SHADER, "main", vec![0x03, 0x02, 0x23, 0x07]);
        let ok = PipelineDesc::compute(shader.clone(), "cs");
        assert!(ok.validate().is_ok());

        let wrong_stage = PipelineDesc::compute(
            ShaderDesc::new(PipelineStages::VERTEX_SHADER, "main", vec![1, 2, 3, 4]),
            "wrong-stage",
        );
        assert!(wrong_stage.validate().is_err());

        let mut bad_push = PipelineDesc::compute(shader, "bad-push");
        bad_push.push_constant_size = 6;
        assert!(bad_push.validate().is_err());
    }
}
