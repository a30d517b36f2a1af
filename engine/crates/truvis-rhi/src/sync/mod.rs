//! 资源访问声明与 barrier 推导

pub mod access;
pub mod graph;
pub mod state;

pub use access::{AccessDeclaration, StreamAccess};
pub use graph::{BarrierRequest, FrameSyncPlan, HazardKind, Origin, PlannedBarrier, SyncEdge, derive_barriers};
pub use state::{AccessFlags, AccessKind, AccessState, ImageLayout, PipelineStages, Scope};

/// 冲突检测的粒度
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncGranularity {
    /// 任意两次访问同一个资源都视为重叠
    #[default]
    WholeResource,
    /// buffer 按声明的字节范围判断重叠
    ByteRange,
}
