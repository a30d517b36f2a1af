//! 同步推导
//!
//! 根据每个 CommandStream 声明的资源访问，计算 stream 之间需要插入的 barrier。
//!
//! 规则：
//! - 读后读（RAR）不需要 barrier
//! - 写后读（RAW）、读后写（WAR）、写后写（WAW）需要 barrier
//! - image 的 layout 变化一定需要 barrier
//! - 只和紧邻的上一组访问者比较：最近一次写入，或者最近一次写入之后的所有读取
//!
//! 一次 RAW barrier 的 dst 会覆盖它之后、下一次写入之前的所有读取，
//! 因此后续的只读 stream 之间不会再出现 barrier。

use std::collections::HashMap;
use std::ops::Range;

use indexmap::IndexMap;

use crate::queue::{QueueKind, TimelinePoint};
use crate::resource::handles::RawHandle;
use crate::sync::SyncGranularity;
use crate::sync::access::{StreamAccess, merge_range};
use crate::sync::state::{AccessFlags, ImageLayout, PipelineStages, Scope};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HazardKind {
    ReadAfterWrite,
    WriteAfterRead,
    WriteAfterWrite,
    /// 没有数据依赖，只有 layout 转换
    LayoutTransition,
}

/// 一次访问来自哪里
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// 当前帧中的第 i 个 stream
    Stream(usize),
    /// 之前已经提交的工作
    Submitted(TimelinePoint),
}

/// 一组合并后的访问
#[derive(Clone, Debug, PartialEq)]
pub struct AccessRecord {
    pub scope: Scope,
    pub range: Option<Range<u64>>,
    pub origins: Vec<Origin>,
}

impl AccessRecord {
    fn new(origin: Origin, scope: Scope, range: Option<Range<u64>>) -> Self {
        Self {
            scope,
            range,
            origins: vec![origin],
        }
    }

    fn merge(&mut self, origin: Origin, scope: Scope, range: &Option<Range<u64>>) {
        self.scope = self.scope.union(scope);
        self.range = merge_range(&self.range, range);
        self.add_origin(origin);
    }

    /// 已提交的来源每个 queue 只保留最大的 timeline 值
    fn add_origin(&mut self, origin: Origin) {
        match origin {
            Origin::Stream(_) => {
                if !self.origins.contains(&origin) {
                    self.origins.push(origin);
                }
            }
            Origin::Submitted(point) => {
                let existing = self.origins.iter_mut().find(|o| match o {
                    Origin::Submitted(p) => p.queue == point.queue,
                    Origin::Stream(_) => false,
                });
                match existing {
                    Some(Origin::Submitted(p)) => p.value = p.value.max(point.value),
                    _ => self.origins.push(origin),
                }
            }
        }
    }

    fn resolve_origins(&mut self, resolve: &impl Fn(usize) -> TimelinePoint) {
        let origins = std::mem::take(&mut self.origins);
        for origin in origins {
            let resolved = match origin {
                Origin::Stream(i) => Origin::Submitted(resolve(i)),
                submitted => submitted,
            };
            self.add_origin(resolved);
        }
    }
}

/// 资源在两次提交之间保存的同步状态
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceSyncState {
    /// 最近一次写入（layout 转换也视为写入）
    pub last_write: Option<AccessRecord>,
    /// 最近一次写入之后的所有读取
    pub reads: Option<AccessRecord>,
    /// 最近一次写入已经对哪些 stage/access 可见
    pub visible: Scope,
    /// `visible` 覆盖的字节范围，None 表示整个资源
    pub visible_range: Option<Range<u64>>,
    /// `visible` 由哪个 queue 上的 barrier 建立，可见性不跨 queue
    pub visible_on: Option<QueueKind>,
    pub layout: ImageLayout,
}

/// 推导出的依赖边
#[derive(Clone, Debug, PartialEq)]
pub struct SyncEdge {
    pub resource: RawHandle,
    /// None 表示依赖之前帧留下的状态
    pub producer: Option<usize>,
    pub consumer: usize,
    pub hazard: HazardKind,
}

/// 需要在 consumer 之前执行的 barrier
#[derive(Clone, Debug, PartialEq)]
pub struct BarrierRequest {
    pub resource: RawHandle,
    pub hazard: HazardKind,
    pub src: Scope,
    pub dst: Scope,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    /// 只在按字节范围追踪时设置
    pub range: Option<Range<u64>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedBarrier {
    pub edge: SyncEdge,
    /// barrier 同步的所有来源
    pub producers: Vec<Origin>,
    pub request: BarrierRequest,
}

/// 一个 stream 的访问汇总以及它提交到的 queue
#[derive(Clone, Copy, Debug)]
pub struct StreamAccesses<'a> {
    pub queue: QueueKind,
    pub accesses: &'a [StreamAccess],
}

#[derive(Clone, Debug, Default)]
pub struct FrameSyncPlan {
    /// 按 consumer 排序
    pub barriers: Vec<PlannedBarrier>,
    /// 每个资源在这一帧结束后的状态
    pub final_states: IndexMap<RawHandle, ResourceSyncState>,
}

impl FrameSyncPlan {
    pub fn barriers_for(&self, consumer: usize) -> impl Iterator<Item = &PlannedBarrier> {
        self.barriers.iter().filter(move |b| b.edge.consumer == consumer)
    }

    pub fn edges(&self) -> impl Iterator<Item = &SyncEdge> {
        self.barriers.iter().map(|b| &b.edge)
    }
}

/// 已经可见的范围是否包含这次访问的范围
#[inline]
fn range_covers(visible: &Option<Range<u64>>, range: &Option<Range<u64>>, granularity: SyncGranularity) -> bool {
    match (granularity, visible, range) {
        (SyncGranularity::ByteRange, Some(v), Some(r)) => v.start <= r.start && r.end <= v.end,
        (SyncGranularity::ByteRange, Some(_), None) => false,
        _ => true,
    }
}

#[inline]
fn overlaps(a: &Option<Range<u64>>, b: &Option<Range<u64>>, granularity: SyncGranularity) -> bool {
    match (granularity, a, b) {
        (SyncGranularity::ByteRange, Some(a), Some(b)) => a.start < b.end && b.start < a.end,
        _ => true,
    }
}

impl ResourceSyncState {
    /// 资源在 stream 中第一次出现时的状态：不需要和之前的任何访问同步
    pub(crate) fn fresh(layout: ImageLayout) -> Self {
        Self {
            layout,
            ..Default::default()
        }
    }

    /// 处理一次新的访问，返回需要插在这次访问之前的 barrier
    ///
    /// `lookahead` 是紧随其后、下一次写入之前的只读访问的合并范围。
    pub(crate) fn apply(
        &mut self,
        origin: Origin,
        queue: QueueKind,
        access: &StreamAccess,
        lookahead: Scope,
        granularity: SyncGranularity,
    ) -> Option<(HazardKind, Vec<Origin>, BarrierRequest)> {
        let kind = access.kind;
        let is_image = access.resource.is_image();
        let layout_change = is_image && access.entry_layout != self.layout;
        let modifies = kind.writes() || layout_change;

        let write_overlaps =
            self.last_write.as_ref().is_some_and(|w| overlaps(&w.range, &access.range, granularity));
        let reads_overlap = self.reads.as_ref().is_some_and(|r| overlaps(&r.range, &access.range, granularity));

        let visible = if self.visible_on == Some(queue) { self.visible } else { Scope::default() };
        let already_visible =
            visible.covers(&access.scope) && range_covers(&self.visible_range, &access.range, granularity);
        let raw = kind.reads() && write_overlaps && !already_visible;
        let waw = modifies && write_overlaps;
        let war = modifies && reads_overlap;

        let hazard = if kind.writes() && waw {
            Some(HazardKind::WriteAfterWrite)
        } else if kind.writes() && war {
            Some(HazardKind::WriteAfterRead)
        } else if raw {
            Some(HazardKind::ReadAfterWrite)
        } else if layout_change {
            Some(HazardKind::LayoutTransition)
        } else {
            None
        };

        let Some(hazard) = hazard else {
            // 没有冲突：合并进已有的记录
            if kind.writes() {
                match &mut self.last_write {
                    Some(write) => write.merge(origin, access.scope, &access.range),
                    None => self.last_write = Some(AccessRecord::new(origin, access.scope, access.range.clone())),
                }
                self.visible = Scope::default();
                self.visible_range = None;
            } else {
                self.merge_read(origin, access);
            }
            if is_image {
                self.layout = access.exit_layout;
            }
            return None;
        };

        // barrier 一旦插入，就同步之前的所有访问
        let mut src = Scope::default();
        let mut producers = Vec::new();
        if let Some(write) = &self.last_write {
            src = src.union(Scope::new(write.scope.stages, write.scope.access.writes()));
            producers.extend(write.origins.iter().copied());
        }
        if let Some(reads) = &self.reads {
            // 读之后的写只需要执行依赖
            src = src.union(Scope::new(reads.scope.stages, AccessFlags::empty()));
            for origin in &reads.origins {
                if !producers.contains(origin) {
                    producers.push(*origin);
                }
            }
        }
        if src.stages.is_empty() {
            src.stages = PipelineStages::TOP_OF_PIPE;
        }

        let dst = if kind.writes() { access.scope } else { access.scope.union(lookahead) };
        let request = BarrierRequest {
            resource: access.resource,
            hazard,
            src,
            dst,
            old_layout: self.layout,
            new_layout: access.entry_layout,
            range: match granularity {
                SyncGranularity::ByteRange => access.range.clone(),
                SyncGranularity::WholeResource => None,
            },
        };

        if kind.writes() {
            self.last_write = Some(AccessRecord::new(origin, access.scope, access.range.clone()));
            self.reads = None;
            self.visible = Scope::default();
            self.visible_range = None;
        } else {
            if layout_change {
                // layout 转换本身相当于一次写入
                self.last_write = Some(AccessRecord::new(origin, Scope::new(dst.stages, AccessFlags::empty()), None));
                self.reads = None;
                self.visible = dst;
                self.visible_range = None;
            } else if visible.is_empty() || self.visible_range == request.range {
                self.visible = visible.union(dst);
                self.visible_range = request.range.clone();
            } else {
                // 不相交的字节范围无法合并成一条可见性记录，只保留这次 barrier 的
                self.visible = dst;
                self.visible_range = request.range.clone();
            }
            self.visible_on = Some(queue);
            self.merge_read(origin, access);
        }
        if is_image {
            self.layout = access.exit_layout;
        }

        Some((hazard, producers, request))
    }

    fn merge_read(&mut self, origin: Origin, access: &StreamAccess) {
        let scope = Scope::new(access.scope.stages, access.scope.access & !AccessFlags::WRITE_MASK);
        match &mut self.reads {
            Some(reads) => reads.merge(origin, scope, &access.range),
            None => self.reads = Some(AccessRecord::new(origin, scope, access.range.clone())),
        }
    }

    /// 提交之后把当前帧的 stream 来源替换成 timeline point
    pub(crate) fn resolve_origins(&mut self, resolve: &impl Fn(usize) -> TimelinePoint) {
        if let Some(write) = &mut self.last_write {
            write.resolve_origins(resolve);
        }
        if let Some(reads) = &mut self.reads {
            reads.resolve_origins(resolve);
        }
    }

    /// 最近一次访问是否是写入
    #[inline]
    pub fn last_access_was_write(&self) -> bool {
        self.last_write.is_some() && self.reads.is_none()
    }
}

/// 后续同一个 queue 上只读访问（直到下一次写入、layout 变化或者换 queue）的合并范围
fn read_lookahead(
    following: &[(usize, &StreamAccess)],
    streams: &[StreamAccesses<'_>],
    queue: QueueKind,
    layout: ImageLayout,
) -> Scope {
    let mut scope = Scope::default();
    for &(stream_index, access) in following {
        if streams[stream_index].queue != queue
            || access.kind.writes()
            || (access.resource.is_image() && access.entry_layout != layout)
        {
            break;
        }
        scope = scope.union(access.scope);
        if access.resource.is_image() && access.exit_layout != layout {
            break;
        }
    }
    scope
}

/// 推导一帧内所有 stream 之间需要的 barrier
///
/// - `initial`: 每个资源在这一帧之前的状态，缺失表示资源还没有被访问过
/// - `streams`: 按提交顺序排列的 stream 访问汇总
///
/// 这是一个纯函数，不会失败。
pub fn derive_barriers(
    initial: &HashMap<RawHandle, ResourceSyncState>,
    streams: &[StreamAccesses<'_>],
    granularity: SyncGranularity,
) -> FrameSyncPlan {
    let _span = crate::rhi_span!("sync::derive_barriers");

    // 按资源收集访问序列，保持 stream 的顺序
    let mut per_resource: IndexMap<RawHandle, Vec<(usize, &StreamAccess)>> = IndexMap::new();
    for (stream_index, stream) in streams.iter().enumerate() {
        for access in stream.accesses {
            per_resource.entry(access.resource).or_default().push((stream_index, access));
        }
    }

    let mut plan = FrameSyncPlan::default();
    for (resource, occurrences) in per_resource {
        let mut state = initial.get(&resource).cloned().unwrap_or_default();
        for (pos, &(stream_index, access)) in occurrences.iter().enumerate() {
            let queue = streams[stream_index].queue;
            let lookahead = if access.kind.writes() {
                Scope::default()
            } else {
                read_lookahead(&occurrences[pos + 1..], streams, queue, access.exit_layout)
            };

            let Some((hazard, producers, request)) =
                state.apply(Origin::Stream(stream_index), queue, access, lookahead, granularity)
            else {
                continue;
            };

            let producer = producers
                .iter()
                .filter_map(|o| match o {
                    Origin::Stream(i) => Some(*i),
                    Origin::Submitted(_) => None,
                })
                .max();
            plan.barriers.push(PlannedBarrier {
                edge: SyncEdge {
                    resource,
                    producer,
                    consumer: stream_index,
                    hazard,
                },
                producers,
                request,
            });
        }
        plan.final_states.insert(resource, state);
    }

    // 稳定排序，同一个 consumer 内保持资源出现的顺序
    plan.barriers.sort_by_key(|b| b.edge.consumer);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::handles::{BufferHandle, ImageHandle};
    use crate::sync::access::{AccessDeclaration, summarize};

    fn stream(decls: Vec<AccessDeclaration>) -> Vec<StreamAccess> {
        summarize(&decls)
    }

    fn plan(streams: &[Vec<StreamAccess>], granularity: SyncGranularity) -> FrameSyncPlan {
        let accesses: Vec<_> = streams
            .iter()
            .map(|s| StreamAccesses {
                queue: QueueKind::Graphics,
                accesses: s,
            })
            .collect();
        derive_barriers(&HashMap::new(), &accesses, granularity)
    }

    #[test]
    fn test_write_then_read_needs_barrier() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let a = stream(vec![AccessDeclaration::write(buffer, PipelineStages::TRANSFER).with_range(0..128)]);
        let b = stream(vec![AccessDeclaration::read(buffer, PipelineStages::COMPUTE_SHADER)]);

        let plan = plan(&[a, b], SyncGranularity::WholeResource);
        assert_eq!(plan.barriers.len(), 1);
        let barrier = &plan.barriers[0];
        assert_eq!(barrier.edge.producer, Some(0));
        assert_eq!(barrier.edge.consumer, 1);
        assert_eq!(barrier.edge.hazard, HazardKind::ReadAfterWrite);
        assert_eq!(barrier.request.src.stages, PipelineStages::TRANSFER);
        assert_eq!(barrier.request.src.access, AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.request.dst.stages, PipelineStages::COMPUTE_SHADER);
    }

    #[test]
    fn test_read_after_read_needs_no_barrier() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams: Vec<_> = (0..4)
            .map(|i| {
                let stage = if i % 2 == 0 { PipelineStages::VERTEX_SHADER } else { PipelineStages::TRANSFER };
                stream(vec![AccessDeclaration::read(buffer, stage)])
            })
            .collect();

        let plan = plan(&streams, SyncGranularity::WholeResource);
        assert!(plan.barriers.is_empty());
    }

    #[test]
    fn test_reads_after_write_share_one_barrier() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams = vec![
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::VERTEX_INPUT)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::FRAGMENT_SHADER)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::TRANSFER)]),
        ];

        let plan = plan(&streams, SyncGranularity::WholeResource);
        assert_eq!(plan.barriers.len(), 1);
        let dst = plan.barriers[0].request.dst;
        assert!(dst.stages.contains(
            PipelineStages::VERTEX_INPUT | PipelineStages::FRAGMENT_SHADER | PipelineStages::TRANSFER
        ));
    }

    #[test]
    fn test_write_after_read_and_write_after_write() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams = vec![
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::VERTEX_SHADER)]),
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::TRANSFER)]),
        ];

        let plan = plan(&streams, SyncGranularity::WholeResource);
        let hazards: Vec<_> = plan.edges().map(|e| (e.producer, e.consumer, e.hazard)).collect();
        assert_eq!(
            hazards,
            vec![
                (Some(0), 1, HazardKind::WriteAfterRead),
                (Some(1), 2, HazardKind::WriteAfterWrite),
            ]
        );
        // WAR 只需要执行依赖
        assert!(plan.barriers[0].request.src.access.is_empty());
    }

    #[test]
    fn test_only_immediately_preceding_accessor() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams = vec![
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::COMPUTE_SHADER)]),
        ];

        let plan = plan(&streams, SyncGranularity::WholeResource);
        let last = plan.barriers_for(2).next().unwrap();
        assert_eq!(last.edge.producer, Some(1));
        assert_eq!(last.producers, vec![Origin::Stream(1)]);
    }

    #[test]
    fn test_undeclared_access_is_conservative() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams = vec![
            stream(vec![AccessDeclaration::new(buffer, None, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::COMPUTE_SHADER)]),
        ];

        let plan = plan(&streams, SyncGranularity::WholeResource);
        assert_eq!(plan.barriers.len(), 1);
        assert_eq!(plan.barriers[0].edge.hazard, HazardKind::ReadAfterWrite);
    }

    #[test]
    fn test_byte_range_granularity() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let write = stream(vec![AccessDeclaration::write(buffer, PipelineStages::TRANSFER).with_range(0..128)]);
        let disjoint = stream(vec![AccessDeclaration::read(buffer, PipelineStages::TRANSFER).with_range(128..256)]);
        let overlapping = stream(vec![AccessDeclaration::read(buffer, PipelineStages::TRANSFER).with_range(64..256)]);

        let byte_range = plan(&[write.clone(), disjoint.clone()], SyncGranularity::ByteRange);
        assert!(byte_range.barriers.is_empty());

        let whole = plan(&[write.clone(), disjoint], SyncGranularity::WholeResource);
        assert_eq!(whole.barriers.len(), 1);

        let overlap = plan(&[write, overlapping], SyncGranularity::ByteRange);
        assert_eq!(overlap.barriers.len(), 1);
        assert_eq!(overlap.barriers[0].request.range, Some(64..256));
    }

    #[test]
    fn test_byte_range_keeps_earlier_disjoint_writes() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams = vec![
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::TRANSFER).with_range(0..128)]),
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::TRANSFER).with_range(128..256)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::TRANSFER).with_range(0..64)]),
        ];

        let plan = plan(&streams, SyncGranularity::ByteRange);
        assert_eq!(plan.barriers.len(), 1);
        assert_eq!(plan.barriers[0].edge.consumer, 2);
        assert_eq!(plan.barriers[0].edge.producer, Some(1));
        assert!(plan.barriers[0].producers.contains(&Origin::Stream(0)));
    }

    #[test]
    fn test_byte_range_readers_of_disjoint_halves() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams = vec![
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::TRANSFER).with_range(0..128)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::TRANSFER).with_range(0..64)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::TRANSFER).with_range(0..32)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::TRANSFER).with_range(64..128)]),
        ];

        // [0, 32) 已经被第一个 barrier 覆盖，[64, 128) 没有
        let plan = plan(&streams, SyncGranularity::ByteRange);
        let barriers: Vec<_> = plan
            .barriers
            .iter()
            .map(|b| (b.edge.consumer, b.edge.hazard, b.request.range.clone()))
            .collect();
        assert_eq!(
            barriers,
            vec![
                (1, HazardKind::ReadAfterWrite, Some(0..64)),
                (3, HazardKind::ReadAfterWrite, Some(64..128)),
            ]
        );
        assert!(plan.barriers[1].producers.contains(&Origin::Stream(0)));
        assert_eq!(plan.final_states[&buffer.raw()].visible_range, Some(64..128));
    }

    #[test]
    fn test_image_layout_transition() {
        let image = ImageHandle::from_raw_parts(0, 1);
        let streams = vec![
            stream(vec![AccessDeclaration::write(image, PipelineStages::TRANSFER)]),
            stream(vec![AccessDeclaration::read(image, PipelineStages::FRAGMENT_SHADER)]),
            stream(vec![AccessDeclaration::read(image, PipelineStages::COMPUTE_SHADER)]),
        ];

        let plan = plan(&streams, SyncGranularity::WholeResource);
        let edges: Vec<_> = plan.edges().map(|e| (e.consumer, e.hazard)).collect();
        // undefined -> transfer dst，然后 transfer dst -> shader read only；两个 shader 读取共享一个 barrier
        assert_eq!(edges, vec![(0, HazardKind::LayoutTransition), (1, HazardKind::ReadAfterWrite)]);
        assert_eq!(plan.barriers[0].request.old_layout, ImageLayout::Undefined);
        assert_eq!(plan.barriers[0].request.new_layout, ImageLayout::TransferDst);
        assert_eq!(plan.barriers[1].request.new_layout, ImageLayout::ShaderReadOnly);
        assert_eq!(plan.final_states[&image.raw()].layout, ImageLayout::ShaderReadOnly);
    }

    #[test]
    fn test_state_carries_across_frames() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let frame0 = vec![stream(vec![AccessDeclaration::write(buffer, PipelineStages::COMPUTE_SHADER)])];
        let plan0 = plan(&frame0, SyncGranularity::WholeResource);

        let point = TimelinePoint::new(QueueKind::Compute, 7);
        let mut initial = HashMap::new();
        let mut state = plan0.final_states[&buffer.raw()].clone();
        state.resolve_origins(&|_| point);
        initial.insert(buffer.raw(), state);

        let frame1 = [stream(vec![AccessDeclaration::read(buffer, PipelineStages::VERTEX_SHADER)])];
        let accesses = [StreamAccesses {
            queue: QueueKind::Graphics,
            accesses: &frame1[0],
        }];
        let plan1 = derive_barriers(&initial, &accesses, SyncGranularity::WholeResource);
        assert_eq!(plan1.barriers.len(), 1);
        assert_eq!(plan1.barriers[0].edge.producer, None);
        assert_eq!(plan1.barriers[0].producers, vec![Origin::Submitted(point)]);
    }

    #[test]
    fn test_visibility_does_not_cross_queues() {
        let buffer = BufferHandle::from_raw_parts(0, 1);
        let streams = [
            stream(vec![AccessDeclaration::write(buffer, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::COMPUTE_SHADER)]),
            stream(vec![AccessDeclaration::read(buffer, PipelineStages::COMPUTE_SHADER)]),
        ];
        let queues = [QueueKind::Graphics, QueueKind::Graphics, QueueKind::Compute, QueueKind::Compute];
        let accesses: Vec<_> = streams
            .iter()
            .zip(queues)
            .map(|(s, queue)| StreamAccesses { queue, accesses: s })
            .collect();

        let plan = derive_barriers(&HashMap::new(), &accesses, SyncGranularity::WholeResource);
        // graphics 上的 barrier 不能让 compute queue 看到写入
        let consumers: Vec<_> = plan.edges().map(|e| e.consumer).collect();
        assert_eq!(consumers, vec![1, 2]);
        assert!(plan.barriers[1].producers.contains(&Origin::Stream(0)));
        assert_eq!(plan.final_states[&buffer.raw()].visible_on, Some(QueueKind::Compute));
    }
}
