use std::ops::Range;

use indexmap::IndexMap;

use crate::resource::handles::RawHandle;
use crate::sync::state::{AccessKind, AccessState, ImageLayout, PipelineStages, Scope};

/// 录制命令时登记的资源访问声明
///
/// `kind` 为 None 表示调用者没有声明访问类型，会被当作读写处理。
#[derive(Clone, Debug, PartialEq)]
pub struct AccessDeclaration {
    pub resource: RawHandle,
    pub kind: Option<AccessKind>,
    pub stages: PipelineStages,
    /// buffer 的字节范围，None 表示整个资源
    pub range: Option<Range<u64>>,
    /// 显式指定的 image layout，None 时由 stage 和访问类型推导
    pub layout: Option<ImageLayout>,
}

impl AccessDeclaration {
    pub fn new(resource: impl Into<RawHandle>, kind: Option<AccessKind>, stages: PipelineStages) -> Self {
        Self {
            resource: resource.into(),
            kind,
            stages,
            range: None,
            layout: None,
        }
    }

    #[inline]
    pub fn read(resource: impl Into<RawHandle>, stages: PipelineStages) -> Self {
        Self::new(resource, Some(AccessKind::Read), stages)
    }

    #[inline]
    pub fn write(resource: impl Into<RawHandle>, stages: PipelineStages) -> Self {
        Self::new(resource, Some(AccessKind::Write), stages)
    }

    #[inline]
    pub fn with_range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    #[inline]
    pub fn with_layout(mut self, layout: ImageLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    #[inline]
    pub fn effective_kind(&self) -> AccessKind {
        self.kind.unwrap_or(AccessKind::ReadWrite)
    }

    pub fn state(&self) -> AccessState {
        let state = AccessState::from_declaration(self.effective_kind(), self.stages, self.resource.is_image());
        match self.layout {
            Some(layout) if self.resource.is_image() => state.with_layout(layout),
            _ => state,
        }
    }
}

/// 一个 CommandStream 对某个资源所有访问的汇总
#[derive(Clone, Debug, PartialEq)]
pub struct StreamAccess {
    pub resource: RawHandle,
    pub kind: AccessKind,
    pub scope: Scope,
    pub range: Option<Range<u64>>,
    /// stream 中第一次访问时需要的 layout
    pub entry_layout: ImageLayout,
    /// stream 结束时资源所处的 layout
    pub exit_layout: ImageLayout,
}

impl StreamAccess {
    pub fn from_declaration(decl: &AccessDeclaration) -> Self {
        let state = decl.state();
        Self {
            resource: decl.resource,
            kind: decl.effective_kind(),
            scope: Scope::of(&state),
            range: decl.range.clone(),
            entry_layout: state.layout,
            exit_layout: state.layout,
        }
    }

    pub fn merge(&mut self, decl: &AccessDeclaration) {
        debug_assert_eq!(self.resource, decl.resource);
        let state = decl.state();
        self.kind = self.kind.union(decl.effective_kind());
        self.scope = self.scope.union(Scope::of(&state));
        self.range = merge_range(&self.range, &decl.range);
        self.exit_layout = state.layout;
    }
}

/// 两个范围的包围盒，任意一方是整个资源时结果也是整个资源
pub fn merge_range(a: &Option<Range<u64>>, b: &Option<Range<u64>>) -> Option<Range<u64>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.start.min(b.start)..a.end.max(b.end)),
        _ => None,
    }
}

/// 按资源第一次出现的顺序汇总声明
pub fn summarize(declarations: &[AccessDeclaration]) -> Vec<StreamAccess> {
    let mut accesses: IndexMap<RawHandle, StreamAccess> = IndexMap::new();
    for decl in declarations {
        match accesses.get_mut(&decl.resource) {
            Some(access) => access.merge(decl),
            None => {
                accesses.insert(decl.resource, StreamAccess::from_declaration(decl));
            }
        }
    }
    accesses.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::handles::{BufferHandle, ImageHandle};

    #[test]
    fn test_undeclared_kind_is_read_write() {
        let decl = AccessDeclaration::new(BufferHandle::from_raw_parts(0, 1), None, PipelineStages::COMPUTE_SHADER);
        assert_eq!(decl.effective_kind(), AccessKind::ReadWrite);
        assert!(decl.state().is_write());
    }

    #[test]
    fn test_summarize_merges_per_resource() {
        let a = BufferHandle::from_raw_parts(0, 1);
        let b = BufferHandle::from_raw_parts(1, 1);
        let decls = vec![
            AccessDeclaration::read(a, PipelineStages::TRANSFER).with_range(0..64),
            AccessDeclaration::write(b, PipelineStages::TRANSFER),
            AccessDeclaration::write(a, PipelineStages::COMPUTE_SHADER).with_range(128..256),
        ];

        let summary = summarize(&decls);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].resource, a.raw());
        assert_eq!(summary[0].kind, AccessKind::ReadWrite);
        assert_eq!(summary[0].range, Some(0..256));
        assert!(summary[0].scope.stages.contains(PipelineStages::TRANSFER | PipelineStages::COMPUTE_SHADER));
        assert_eq!(summary[1].kind, AccessKind::Write);
    }

    #[test]
    fn test_summarize_tracks_entry_and_exit_layout() {
        let image = ImageHandle::from_raw_parts(3, 1);
        let decls = vec![
            AccessDeclaration::write(image, PipelineStages::TRANSFER),
            AccessDeclaration::read(image, PipelineStages::FRAGMENT_SHADER),
        ];

        let summary = summarize(&decls);
        assert_eq!(summary[0].entry_layout, ImageLayout::TransferDst);
        assert_eq!(summary[0].exit_layout, ImageLayout::ShaderReadOnly);
    }
}
