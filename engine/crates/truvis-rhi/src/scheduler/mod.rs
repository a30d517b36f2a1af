//! 一帧的提交
//!
//! 1. 收集所有 stream 涉及的资源在上一帧结束时的同步状态，推导 stream 之间的 barrier
//! 2. 相邻的、同一个 queue 上的 stream 组成一个 segment，每个 segment 是一次 queue 提交
//! 3. 依赖其他 queue 上产生的资源时，等待对应 segment（或者之前的帧）的 timeline point
//! 4. 把句柄解析成后端对象，编码并提交
//! 5. 记录资源的最后使用帧和同步状态，归还 pool
//!
//! 整个过程在 scheduler 锁内完成，不同帧的 segment 不会在同一个 queue 上交错。

use std::collections::HashMap;
use std::ops::Range;

use crate::backend::{ObjectId, ResolvedAttachment, ResolvedBarrier, ResolvedCommand};
use crate::commands::command::{Attachment, Command};
use crate::commands::CommandStream;
use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::frame::{Fence, FrameIndex, FrameManager};
use crate::queue::{Queue, QueueKind, TimelinePoint};
use crate::resource::handles::RawHandle;
use crate::resource::{ResourceTable, UsageState};
use crate::sync::graph::{ResourceSyncState, StreamAccesses};
use crate::sync::{BarrierRequest, ImageLayout, Origin, SyncEdge, derive_barriers};

/// 一次 queue 提交的信息
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentReport {
    pub queue: QueueKind,
    /// segment 包含的 stream 在提交列表中的范围
    pub streams: Range<usize>,
    pub waits: Vec<TimelinePoint>,
    pub signal: TimelinePoint,
    /// stream 之间的 barrier 数
    pub barriers: usize,
    /// 编码的命令总数
    pub commands: usize,
}

/// `submit_frame` 的结果，用于调试和测试
#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionReport {
    pub frame: FrameIndex,
    pub segments: Vec<SegmentReport>,
    pub edges: Vec<SyncEdge>,
    /// stream 之间插入的 barrier 数
    pub barrier_count: usize,
    /// stream 内部录制时插入的 barrier 数
    pub stream_barrier_count: usize,
}

impl SubmissionReport {
    /// 第 i 个 stream 所在的 segment
    pub fn segment_of(&self, stream: usize) -> Option<&SegmentReport> {
        self.segments.iter().find(|s| s.streams.contains(&stream))
    }
}

/// 提交之前的一个 segment
struct Segment {
    queue: QueueKind,
    streams: Range<usize>,
    signal: TimelinePoint,
    waits: Vec<TimelinePoint>,
    commands: Vec<ResolvedCommand>,
    barriers: usize,
}

pub struct SubmissionScheduler {
    queues: Vec<Queue>,
    primary: QueueKind,
    last_submission: Option<SubmissionReport>,
}
// new & init
impl SubmissionScheduler {
    pub fn new(queues: Vec<Queue>, primary: QueueKind) -> Self {
        Self {
            queues,
            primary,
            last_submission: None,
        }
    }
}
// getters
impl SubmissionScheduler {
    #[inline]
    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    #[inline]
    pub fn queue(&self, kind: QueueKind) -> Option<&Queue> {
        self.queues.iter().find(|q| q.kind() == kind)
    }

    #[inline]
    pub fn primary(&self) -> QueueKind {
        self.primary
    }

    #[inline]
    pub fn last_submission(&self) -> Option<&SubmissionReport> {
        self.last_submission.as_ref()
    }

    fn queue_mut(&mut self, kind: QueueKind) -> RhiResult<&mut Queue> {
        self.queues.iter_mut().find(|q| q.kind() == kind).ok_or(RhiError::QueueUnavailable(kind))
    }
}
// submit
impl SubmissionScheduler {
    /// 按调用者给定的顺序提交一帧的所有 stream
    pub(crate) fn submit_frame(
        &mut self,
        device: &DeviceShared,
        frames: &mut FrameManager,
        frame: FrameIndex,
        streams: Vec<CommandStream>,
    ) -> RhiResult<Fence> {
        let _span = crate::rhi_span!("SubmissionScheduler::submit_frame");
        frames.ensure_open(frame)?;
        for stream in &streams {
            if stream.frame != frame {
                return Err(RhiError::FrameMismatch {
                    frame,
                    stream: stream.frame,
                });
            }
            if self.queue(stream.queue).is_none() {
                return Err(RhiError::QueueUnavailable(stream.queue));
            }
        }

        let frame_name = frames.frame_name(frame);
        let slot = frame.slot(frames.fif_count());
        let mut table = device.table.write();

        // 同步推导
        let mut initial: HashMap<RawHandle, ResourceSyncState> = HashMap::new();
        for stream in &streams {
            for access in &stream.accesses {
                if !initial.contains_key(&access.resource) {
                    let state = table.resolve_for_submit(access.resource)?.sync.clone();
                    initial.insert(access.resource, state);
                }
            }
        }
        let stream_accesses: Vec<_> = streams
            .iter()
            .map(|s| StreamAccesses {
                queue: s.queue,
                accesses: &s.accesses,
            })
            .collect();
        let plan = derive_barriers(&initial, &stream_accesses, device.config.sync.granularity);

        // 划分 segment，预先计算每个 segment 将要 signal 的点
        let mut next_value: HashMap<QueueKind, u64> = self.queues.iter().map(|q| (q.kind(), q.last_signaled())).collect();
        let mut segments: Vec<Segment> = Vec::new();
        let mut segment_of = Vec::with_capacity(streams.len());
        for (index, stream) in streams.iter().enumerate() {
            match segments.last_mut() {
                Some(segment) if segment.queue == stream.queue => segment.streams.end = index + 1,
                _ => {
                    let value = next_value.entry(stream.queue).or_insert(0);
                    *value += 1;
                    segments.push(Segment {
                        queue: stream.queue,
                        streams: index..index + 1,
                        signal: TimelinePoint::new(stream.queue, *value),
                        waits: Vec::new(),
                        commands: Vec::new(),
                        barriers: 0,
                    });
                }
            }
            segment_of.push(segments.len() - 1);
        }

        // 跨 queue 的依赖变成 timeline 等待
        for barrier in &plan.barriers {
            let consumer = segment_of[barrier.edge.consumer];
            let queue = segments[consumer].queue;
            for producer in &barrier.producers {
                let point = match *producer {
                    Origin::Stream(i) => segments[segment_of[i]].signal,
                    Origin::Submitted(point) => {
                        if self.queue(point.queue).is_none_or(|q| q.is_reached(point.value)) {
                            continue;
                        }
                        point
                    }
                };
                if point.queue != queue {
                    add_wait(&mut segments[consumer].waits, point);
                }
            }
        }

        // 解析所有命令
        let label_streams = device.config.debug.label_streams;
        for segment in &mut segments {
            for index in segment.streams.clone() {
                let stream = &streams[index];
                if label_streams {
                    segment.commands.push(ResolvedCommand::BeginLabel(stream.label.clone()));
                }
                for planned in plan.barriers_for(index) {
                    segment.commands.push(ResolvedCommand::Barrier(resolve_barrier(&table, &planned.request)?));
                    segment.barriers += 1;
                }
                resolve_stream(&table, stream, &mut segment.commands)?;
                if label_streams {
                    segment.commands.push(ResolvedCommand::EndLabel);
                }
            }
        }

        // 先编码所有 segment，编码失败时还没有任何工作进入 queue，这一帧保持打开
        let mut encoded_segments = Vec::with_capacity(segments.len());
        for segment in segments {
            let mut encoder = device.backend.create_encoder(segment.queue, slot)?;
            for command in &segment.commands {
                encoder.encode(command)?;
            }
            let encoded = encoder.finish()?;
            encoded_segments.push((segment, encoded));
        }

        // 提交
        let mut reports = Vec::with_capacity(encoded_segments.len());
        let mut last_points: HashMap<QueueKind, TimelinePoint> = HashMap::new();
        let mut submit_error = None;
        for (index, (segment, encoded)) in encoded_segments.into_iter().enumerate() {
            let label = format!("{frame_name}-{}-{index}", segment.queue);
            let stream_count = segment.streams.len();
            let submitted = self
                .queue_mut(segment.queue)
                .and_then(|queue| queue.submit(frame, Some(encoded), segment.waits.clone(), stream_count, label));
            let point = match submitted {
                Ok(point) => point,
                Err(e) => {
                    submit_error = Some(e);
                    break;
                }
            };
            debug_assert_eq!(point, segment.signal, "timeline prediction diverged");
            last_points.insert(segment.queue, point);

            reports.push(SegmentReport {
                queue: segment.queue,
                streams: segment.streams,
                waits: segment.waits,
                signal: point,
                barriers: segment.barriers,
                commands: segment.commands.len(),
            });
        }
        if let Some(e) = &submit_error {
            if reports.is_empty() {
                return Err(e.clone());
            }
            log::error!(
                "submit {} failed after {} segments were queued: {}",
                frame_name,
                reports.len(),
                e
            );
        } else if !last_points.contains_key(&self.primary) {
            let primary = self.primary;
            let queue = self.queue_mut(primary)?;
            let point = queue.submit(frame, None, Vec::new(), 0, format!("{frame_name}-{primary}-empty"))?;
            last_points.insert(primary, point);
        }

        let mut fence = Fence::new(frame);
        for queue in &self.queues {
            if let Some(point) = last_points.get(&queue.kind()) {
                fence.add(*point, queue.backend().clone());
            }
        }

        // 记录资源的使用；部分提交时所有资源同样要等这一帧的 fence 才能回收
        for stream in &streams {
            for raw in stream.referenced() {
                table.resolve_for_submit_mut(raw)?.stamp(frame);
            }
        }
        if submit_error.is_none() {
            let signals: Vec<TimelinePoint> = segment_of.iter().map(|&s| reports[s].signal).collect();
            for (raw, mut state) in plan.final_states.clone() {
                state.resolve_origins(&|i| signals[i]);
                let resource = table.resolve_for_submit_mut(raw)?;
                resource.usage = if raw.is_image() && state.layout == ImageLayout::Present {
                    UsageState::Presenting
                } else if state.last_access_was_write() {
                    UsageState::Write
                } else {
                    UsageState::ReadOnly
                };
                resource.sync = state;
            }
        }
        for raw in frames.take_transient(frame) {
            if let Err(e) = table.destroy(raw, Some(frame)) {
                log::debug!("transient {} already destroyed: {}", raw, e);
            }
        }
        drop(table);

        let stream_barrier_count = streams.iter().map(|s| s.barrier_count()).sum();
        for stream in streams {
            frames.return_pool(frame, stream.into_pool(), true);
        }
        frames.submit(frame, fence.clone())?;
        if let Some(e) = submit_error {
            return Err(e);
        }

        let report = SubmissionReport {
            frame,
            edges: plan.edges().cloned().collect(),
            barrier_count: plan.barriers.len(),
            stream_barrier_count,
            segments: reports,
        };
        log::debug!(
            "submit {}: {} segments, {} barriers between streams",
            frame_name,
            report.segments.len(),
            report.barrier_count
        );
        self.last_submission = Some(report);
        Ok(fence)
    }
}

/// 每个 queue 只等待最大的值
fn add_wait(waits: &mut Vec<TimelinePoint>, point: TimelinePoint) {
    match waits.iter_mut().find(|w| w.queue == point.queue) {
        Some(wait) => wait.value = wait.value.max(point.value),
        None => waits.push(point),
    }
}

#[inline]
fn object_of(table: &ResourceTable, raw: impl Into<RawHandle>) -> RhiResult<ObjectId> {
    Ok(table.resolve_for_submit(raw.into())?.object)
}

fn resolve_barrier(table: &ResourceTable, request: &BarrierRequest) -> RhiResult<ResolvedBarrier> {
    Ok(ResolvedBarrier {
        object: object_of(table, request.resource)?,
        resource_type: request.resource.resource_type(),
        src: request.src,
        dst: request.dst,
        old_layout: request.old_layout,
        new_layout: request.new_layout,
        range: request.range.clone(),
    })
}

fn resolve_attachment(table: &ResourceTable, attachment: &Attachment) -> RhiResult<ResolvedAttachment> {
    Ok(ResolvedAttachment {
        image: object_of(table, attachment.image)?,
        load: attachment.load,
        store: attachment.store,
    })
}

/// 把 stream 中的命令解析成后端对象
fn resolve_stream(table: &ResourceTable, stream: &CommandStream, out: &mut Vec<ResolvedCommand>) -> RhiResult<()> {
    let mut compute = false;
    for command in stream.commands() {
        let resolved = match command {
            Command::BindPipeline(pipeline) => {
                let resource = table.resolve_for_submit(pipeline.raw())?;
                compute = resource.as_pipeline().is_some_and(|p| p.is_compute());
                ResolvedCommand::BindPipeline {
                    pipeline: resource.object,
                    compute,
                }
            }
            Command::BindDescriptorSet { set_index, set } => ResolvedCommand::BindDescriptorSet {
                set_index: *set_index,
                set: object_of(table, *set)?,
                compute,
            },
            Command::BindVertexBuffer { binding, buffer, offset } => ResolvedCommand::BindVertexBuffer {
                binding: *binding,
                buffer: object_of(table, *buffer)?,
                offset: *offset,
            },
            Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => ResolvedCommand::BindIndexBuffer {
                buffer: object_of(table, *buffer)?,
                offset: *offset,
                index_type: *index_type,
            },
            Command::PushConstants { offset, data } => ResolvedCommand::PushConstants {
                offset: *offset,
                data: data.clone(),
            },
            Command::BeginRendering(info) => ResolvedCommand::BeginRendering {
                extent: info.extent,
                color: info
                    .color
                    .iter()
                    .map(|a| resolve_attachment(table, a))
                    .collect::<RhiResult<_>>()?,
                depth: info.depth.as_ref().map(|a| resolve_attachment(table, a)).transpose()?,
            },
            Command::EndRendering => ResolvedCommand::EndRendering,
            Command::Draw { vertices, instances } => ResolvedCommand::Draw {
                vertices: vertices.clone(),
                instances: instances.clone(),
            },
            Command::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            } => ResolvedCommand::DrawIndexed {
                indices: indices.clone(),
                vertex_offset: *vertex_offset,
                instances: instances.clone(),
            },
            Command::Dispatch { groups } => ResolvedCommand::Dispatch { groups: *groups },
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => ResolvedCommand::CopyBuffer {
                src: object_of(table, *src)?,
                src_offset: *src_offset,
                dst: object_of(table, *dst)?,
                dst_offset: *dst_offset,
                size: *size,
            },
            Command::CopyBufferToImage { src, src_offset, dst } => ResolvedCommand::CopyBufferToImage {
                src: object_of(table, *src)?,
                src_offset: *src_offset,
                dst: object_of(table, *dst)?,
            },
            Command::CopyImageToBuffer { src, dst, dst_offset } => ResolvedCommand::CopyImageToBuffer {
                src: object_of(table, *src)?,
                dst: object_of(table, *dst)?,
                dst_offset: *dst_offset,
            },
            Command::FillBuffer {
                dst,
                offset,
                size,
                value,
            } => ResolvedCommand::FillBuffer {
                dst: object_of(table, *dst)?,
                offset: *offset,
                size: *size,
                value: *value,
            },
            Command::ClearImage { image, value } => ResolvedCommand::ClearImage {
                image: object_of(table, *image)?,
                value: *value,
            },
            Command::Barrier(request) => ResolvedCommand::Barrier(resolve_barrier(table, request)?),
            Command::BeginLabel(label) => ResolvedCommand::BeginLabel(label.clone()),
            Command::EndLabel => ResolvedCommand::EndLabel,
        };
        out.push(resolved);
    }

    // GPU 写入了 host visible 的 buffer：之后的 readback 需要看到结果
    let mut host_writes = false;
    for access in stream.accesses() {
        if access.kind.writes() && table.resolve_for_submit(access.resource)?.is_host_visible() {
            host_writes = true;
        }
    }
    if host_writes {
        out.push(ResolvedCommand::HostBarrier);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::WorkerId;
    use crate::config::RhiConfig;
    use crate::device::Device;
    use crate::resource::desc::{BufferDesc, BufferUsage, MemoryLocality};
    use crate::resource::handles::BufferHandle;
    use crate::sync::{AccessKind, HazardKind, PipelineStages};

    fn buffer(device: &Device, label: &str) -> BufferHandle {
        let usage = BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST | BufferUsage::STORAGE;
        device
            .create_buffer(BufferDesc::new(256, usage, MemoryLocality::DeviceLocal, label))
            .unwrap()
    }

    fn record(
        device: &Device,
        frame: FrameIndex,
        worker: u64,
        queue: QueueKind,
        f: impl FnOnce(&mut crate::commands::RecordingSession<'_>),
    ) -> CommandStream {
        let mut recorder = device.acquire_recorder(frame, WorkerId(worker), queue).unwrap();
        let mut session = recorder.begin(frame).unwrap();
        f(&mut session);
        session.end().unwrap()
    }

    #[test]
    fn test_cross_queue_dependency_waits_on_producer_segment() {
        let (device, backend) = Device::headless(RhiConfig::default()).unwrap();
        let a = buffer(&device, "a");
        let b = buffer(&device, "b");
        let frame = device.begin_frame().unwrap();

        let producer = record(&device, frame, 1, QueueKind::Compute, |s| s.fill_buffer(a, 0, 256, 1).unwrap());
        let consumer = record(&device, frame, 2, QueueKind::Graphics, |s| s.copy_buffer(a, 0, b, 0, 256).unwrap());
        let fence = device.submit_frame(frame, vec![producer, consumer]).unwrap();

        let report = device.last_submission().unwrap();
        assert_eq!(report.segments.len(), 2);
        let compute = &report.segments[0];
        let graphics = &report.segments[1];
        assert_eq!(compute.queue, QueueKind::Compute);
        assert_eq!(graphics.waits, vec![compute.signal]);
        assert_eq!(report.edges.len(), 1);
        assert_eq!(report.edges[0].hazard, HazardKind::ReadAfterWrite);
        assert_eq!(report.edges[0].producer, Some(0));

        assert!(fence.wait(std::time::Duration::from_secs(5)).unwrap());
        assert_eq!(fence.points().count(), 2);
        assert_eq!(backend.executed_batches().len(), 2);
    }

    #[test]
    fn test_consecutive_streams_share_a_segment() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let a = buffer(&device, "a");
        let frame = device.begin_frame().unwrap();

        let streams = (0..3)
            .map(|i| {
                record(&device, frame, i, QueueKind::Graphics, |s| {
                    s.bind_resource(a, Some(AccessKind::Read), PipelineStages::COMPUTE_SHADER).unwrap()
                })
            })
            .collect();
        device.submit_frame(frame, streams).unwrap();

        let report = device.last_submission().unwrap();
        assert_eq!(report.segments.len(), 1);
        assert_eq!(report.segments[0].streams, 0..3);
        assert_eq!(report.barrier_count, 0);
    }

    #[test]
    fn test_primary_queue_always_signaled() {
        let (device, backend) = Device::headless(RhiConfig::default()).unwrap();
        let a = buffer(&device, "a");
        let frame = device.begin_frame().unwrap();
        let stream = record(&device, frame, 1, QueueKind::Transfer, |s| s.fill_buffer(a, 0, 16, 0).unwrap());
        let fence = device.submit_frame(frame, vec![stream]).unwrap();

        assert!(fence.wait(std::time::Duration::from_secs(5)).unwrap());
        let queues: Vec<_> = fence.points().map(|p| p.queue).collect();
        assert!(queues.contains(&QueueKind::Graphics));
        assert!(queues.contains(&QueueKind::Transfer));
        assert!(backend.executed_batches().iter().any(|b| b.queue == QueueKind::Graphics && b.commands.is_empty()));
    }

    #[test]
    fn test_submit_protocol_errors() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let a = buffer(&device, "a");
        let frame = device.begin_frame().unwrap();
        let stream = record(&device, frame, 1, QueueKind::Graphics, |s| s.fill_buffer(a, 0, 16, 0).unwrap());
        device.submit_frame(frame, vec![stream]).unwrap();

        // 同一帧提交两次
        assert_eq!(device.submit_frame(frame, Vec::new()).unwrap_err(), RhiError::FrameNotActive(frame));

        let next = device.begin_frame().unwrap();
        let stale = record(&device, next, 1, QueueKind::Graphics, |s| s.fill_buffer(a, 0, 16, 0).unwrap());
        let other = device.begin_frame();
        assert_eq!(other.unwrap_err(), RhiError::FrameNotSubmitted(next));
        device.submit_frame(next, vec![stale]).unwrap();

        let third = device.begin_frame().unwrap();
        let stream = record(&device, third, 1, QueueKind::Graphics, |s| s.fill_buffer(a, 0, 16, 0).unwrap());
        let mut wrong = stream;
        wrong.frame = next;
        assert_eq!(
            device.submit_frame(third, vec![wrong]).unwrap_err(),
            RhiError::FrameMismatch {
                frame: third,
                stream: next
            }
        );
    }

    #[test]
    fn test_state_persists_between_frames() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let a = buffer(&device, "a");

        let frame = device.begin_frame().unwrap();
        let stream = record(&device, frame, 1, QueueKind::Graphics, |s| s.fill_buffer(a, 0, 256, 0).unwrap());
        device.submit_frame(frame, vec![stream]).unwrap();

        // 上一帧的写入在这一帧的第一次读取之前需要 barrier
        let frame = device.begin_frame().unwrap();
        let stream = record(&device, frame, 1, QueueKind::Graphics, |s| {
            s.bind_resource(a, Some(AccessKind::Read), PipelineStages::COMPUTE_SHADER).unwrap()
        });
        device.submit_frame(frame, vec![stream]).unwrap();
        let report = device.last_submission().unwrap();
        assert_eq!(report.barrier_count, 1);
        assert_eq!(report.edges[0].producer, None);

        // 已经可见之后，只读的帧不再有 barrier
        let frame = device.begin_frame().unwrap();
        let stream = record(&device, frame, 1, QueueKind::Graphics, |s| {
            s.bind_resource(a, Some(AccessKind::Read), PipelineStages::COMPUTE_SHADER).unwrap()
        });
        device.submit_frame(frame, vec![stream]).unwrap();
        assert_eq!(device.last_submission().unwrap().barrier_count, 0);
    }
}
