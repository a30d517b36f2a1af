//! 资源状态定义
//!
//! 封装 pipeline stage、access mask 和 image layout，
//! 并从访问声明推导出具体的 access mask 和 layout。

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const HOST = 1 << 10;
        const BOTTOM_OF_PIPE = 1 << 11;
        const ALL_COMMANDS = 1 << 12;

        const FRAGMENT_TESTS = Self::EARLY_FRAGMENT_TESTS.bits() | Self::LATE_FRAGMENT_TESTS.bits();
        const ALL_SHADERS = Self::VERTEX_SHADER.bits() | Self::FRAGMENT_SHADER.bits() | Self::COMPUTE_SHADER.bits();
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const SHADER_SAMPLED_READ = 1 << 4;
        const SHADER_STORAGE_READ = 1 << 5;
        const SHADER_STORAGE_WRITE = 1 << 6;
        const COLOR_ATTACHMENT_READ = 1 << 7;
        const COLOR_ATTACHMENT_WRITE = 1 << 8;
        const DEPTH_STENCIL_READ = 1 << 9;
        const DEPTH_STENCIL_WRITE = 1 << 10;
        const TRANSFER_READ = 1 << 11;
        const TRANSFER_WRITE = 1 << 12;
        const HOST_READ = 1 << 13;
        const HOST_WRITE = 1 << 14;
        const MEMORY_READ = 1 << 15;
        const MEMORY_WRITE = 1 << 16;
    }
}

impl AccessFlags {
    /// 写操作的 access flags
    pub const WRITE_MASK: Self = Self::from_bits_truncate(
        Self::SHADER_STORAGE_WRITE.bits()
            | Self::COLOR_ATTACHMENT_WRITE.bits()
            | Self::DEPTH_STENCIL_WRITE.bits()
            | Self::TRANSFER_WRITE.bits()
            | Self::HOST_WRITE.bits()
            | Self::MEMORY_WRITE.bits(),
    );

    #[inline]
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITE_MASK)
    }

    /// 只保留写操作，用于 barrier 的 src access
    #[inline]
    pub fn writes(self) -> Self {
        self & Self::WRITE_MASK
    }
}

/// 声明的访问类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
}

impl AccessKind {
    #[inline]
    pub fn reads(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::ReadWrite)
    }

    #[inline]
    pub fn writes(self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::ReadWrite)
    }

    #[inline]
    pub fn union(self, other: Self) -> Self {
        match (self.reads() || other.reads(), self.writes() || other.writes()) {
            (true, true) => AccessKind::ReadWrite,
            (false, true) => AccessKind::Write,
            _ => AccessKind::Read,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

/// 一次访问的 pipeline stage + access mask + image layout
///
/// 对于 buffer 等没有 layout 的资源，layout 恒为 `Undefined`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AccessState {
    pub stages: PipelineStages,
    pub access: AccessFlags,
    pub layout: ImageLayout,
}

// 由声明推导状态
impl AccessState {
    /// 根据访问类型和 pipeline stage 推导 access mask 和 image layout
    ///
    /// `is_image` 为 false 时 layout 固定为 `Undefined`。
    pub fn from_declaration(kind: AccessKind, stages: PipelineStages, is_image: bool) -> Self {
        let mut access = AccessFlags::empty();
        for stage in stages.iter() {
            access |= Self::stage_access(stage, kind, is_image);
        }
        if access.is_empty() {
            access = Self::generic_access(kind);
        }

        let layout = if is_image { Self::infer_layout(kind, stages) } else { ImageLayout::Undefined };
        Self { stages, access, layout }
    }

    fn generic_access(kind: AccessKind) -> AccessFlags {
        let mut access = AccessFlags::empty();
        if kind.reads() {
            access |= AccessFlags::MEMORY_READ;
        }
        if kind.writes() {
            access |= AccessFlags::MEMORY_WRITE;
        }
        access
    }

    fn stage_access(stage: PipelineStages, kind: AccessKind, is_image: bool) -> AccessFlags {
        let (read, write) = match stage {
            PipelineStages::DRAW_INDIRECT => (AccessFlags::INDIRECT_COMMAND_READ, AccessFlags::MEMORY_WRITE),
            PipelineStages::VERTEX_INPUT => (
                AccessFlags::VERTEX_ATTRIBUTE_READ | AccessFlags::INDEX_READ,
                AccessFlags::MEMORY_WRITE,
            ),
            PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER | PipelineStages::COMPUTE_SHADER => {
                let read = if is_image {
                    AccessFlags::SHADER_SAMPLED_READ | AccessFlags::SHADER_STORAGE_READ
                } else {
                    AccessFlags::UNIFORM_READ | AccessFlags::SHADER_STORAGE_READ
                };
                (read, AccessFlags::SHADER_STORAGE_WRITE)
            }
            PipelineStages::EARLY_FRAGMENT_TESTS | PipelineStages::LATE_FRAGMENT_TESTS => {
                (AccessFlags::DEPTH_STENCIL_READ, AccessFlags::DEPTH_STENCIL_WRITE)
            }
            PipelineStages::COLOR_ATTACHMENT_OUTPUT => {
                (AccessFlags::COLOR_ATTACHMENT_READ, AccessFlags::COLOR_ATTACHMENT_WRITE)
            }
            PipelineStages::TRANSFER => (AccessFlags::TRANSFER_READ, AccessFlags::TRANSFER_WRITE),
            PipelineStages::HOST => (AccessFlags::HOST_READ, AccessFlags::HOST_WRITE),
            PipelineStages::ALL_COMMANDS => (AccessFlags::MEMORY_READ, AccessFlags::MEMORY_WRITE),
            // TOP_OF_PIPE / BOTTOM_OF_PIPE 不访问内存
            _ => (AccessFlags::empty(), AccessFlags::empty()),
        };

        let mut access = AccessFlags::empty();
        if kind.reads() {
            access |= read;
        }
        if kind.writes() {
            access |= write;
        }
        access
    }

    fn infer_layout(kind: AccessKind, stages: PipelineStages) -> ImageLayout {
        if stages == PipelineStages::TRANSFER {
            return match kind {
                AccessKind::Read => ImageLayout::TransferSrc,
                AccessKind::Write => ImageLayout::TransferDst,
                AccessKind::ReadWrite => ImageLayout::General,
            };
        }
        if stages == PipelineStages::COLOR_ATTACHMENT_OUTPUT {
            return ImageLayout::ColorAttachment;
        }
        if !stages.is_empty() && PipelineStages::FRAGMENT_TESTS.contains(stages) {
            return ImageLayout::DepthStencilAttachment;
        }
        if !stages.is_empty() && PipelineStages::ALL_SHADERS.contains(stages) {
            return match kind {
                AccessKind::Read => ImageLayout::ShaderReadOnly,
                _ => ImageLayout::General,
            };
        }
        ImageLayout::General
    }
}
// tools
impl AccessState {
    /// 检查是否为写操作
    #[inline]
    pub fn is_write(&self) -> bool {
        self.access.is_write()
    }

    #[inline]
    pub fn with_layout(mut self, layout: ImageLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// 一组 stage + access，用来表达 barrier 的一侧或者可见性范围
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Scope {
    pub stages: PipelineStages,
    pub access: AccessFlags,
}

impl Scope {
    #[inline]
    pub const fn new(stages: PipelineStages, access: AccessFlags) -> Self {
        Self { stages, access }
    }

    #[inline]
    pub fn of(state: &AccessState) -> Self {
        Self::new(state.stages, state.access)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty() && self.access.is_empty()
    }

    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self::new(self.stages | other.stages, self.access | other.access)
    }

    /// self 是否已经覆盖了 other
    #[inline]
    pub fn covers(&self, other: &Self) -> bool {
        self.stages.contains(other.stages) && self.access.contains(other.access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_access_mask() {
        let state = AccessState::from_declaration(AccessKind::Write, PipelineStages::TRANSFER, false);
        assert_eq!(state.access, AccessFlags::TRANSFER_WRITE);
        assert!(state.is_write());
        assert_eq!(state.layout, ImageLayout::Undefined);

        let state = AccessState::from_declaration(AccessKind::Read, PipelineStages::FRAGMENT_SHADER, true);
        assert!(!state.is_write());
        assert_eq!(state.layout, ImageLayout::ShaderReadOnly);
    }

    #[test]
    fn test_undeclared_stage_falls_back_to_memory_access() {
        let state = AccessState::from_declaration(AccessKind::ReadWrite, PipelineStages::TOP_OF_PIPE, false);
        assert_eq!(state.access, AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE);
    }

    #[test]
    fn test_transfer_layouts() {
        let src = AccessState::from_declaration(AccessKind::Read, PipelineStages::TRANSFER, true);
        let dst = AccessState::from_declaration(AccessKind::Write, PipelineStages::TRANSFER, true);
        assert_eq!(src.layout, ImageLayout::TransferSrc);
        assert_eq!(dst.layout, ImageLayout::TransferDst);
        assert_eq!(src.access, AccessFlags::TRANSFER_READ);
        assert_eq!(dst.access, AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn test_scope_covers() {
        let a = Scope::new(PipelineStages::ALL_SHADERS, AccessFlags::SHADER_STORAGE_READ);
        let b = Scope::new(PipelineStages::COMPUTE_SHADER, AccessFlags::SHADER_STORAGE_READ);
        assert!(a.covers(&b));
        assert!(!b.covers(&a));
    }

    #[test]
    fn test_access_kind_union() {
        assert_eq!(AccessKind::Read.union(AccessKind::Read), AccessKind::Read);
        assert_eq!(AccessKind::Read.union(AccessKind::Write), AccessKind::ReadWrite);
        assert_eq!(AccessKind::Write.union(AccessKind::Write), AccessKind::Write);
    }
}
