//! 命令录制
//!
//! `CommandRecorder` 由 `Device::acquire_recorder` 获得，只能录制一次：
//! `begin` 得到 `RecordingSession`，`end` 得到 `CommandStream`。
//!
//! 每条命令都会登记资源访问声明；同一个 stream 内冲突的访问由同一套同步规则插入 barrier，
//! 不提供手动 barrier 的接口。

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ops::Range;
use std::sync::Arc;

use indexmap::IndexSet;

use crate::commands::WorkerId;
use crate::commands::command::{Attachment, ClearValue, Command, IndexType, LoadOp, RenderingInfo};
use crate::commands::stream::{CommandPool, CommandStream};
use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::frame::FrameIndex;
use crate::queue::QueueKind;
use crate::resource::desc::{BufferUsage, DescriptorResource, DescriptorSetLayout, ImageUsage};
use crate::resource::handles::{BufferHandle, DescriptorSetHandle, ImageHandle, PipelineHandle, RawHandle};
use crate::sync::access::summarize;
use crate::sync::graph::ResourceSyncState;
use crate::sync::{
    AccessDeclaration, AccessKind, BarrierRequest, HazardKind, ImageLayout, Origin, PipelineStages, Scope,
    StreamAccess,
};

/// 某个 worker 在某一帧中的命令录制器
///
/// 可以移动到其他线程录制。
pub struct CommandRecorder {
    device: Arc<DeviceShared>,
    frame: FrameIndex,
    worker: WorkerId,
    queue: QueueKind,
    label: String,

    /// `begin` 之后变为 None
    pool: Option<CommandPool>,
}
// new & init
impl CommandRecorder {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        frame: FrameIndex,
        worker: WorkerId,
        queue: QueueKind,
        pool: CommandPool,
        label: String,
    ) -> Self {
        Self {
            device,
            frame,
            worker,
            queue,
            label,
            pool: Some(pool),
        }
    }

    /// 开始录制
    ///
    /// 每个 recorder 只能开始一次，之后再调用返回 `RecorderClosed`。
    pub fn begin(&mut self, frame: FrameIndex) -> RhiResult<RecordingSession<'_>> {
        self.device.check_alive()?;
        if frame != self.frame {
            return Err(RhiError::FrameNotActive(frame));
        }
        if self.pool.is_none() {
            return Err(RhiError::RecorderClosed);
        }
        self.device.frames.lock().ensure_open(frame)?;

        let Some(mut pool) = self.pool.take() else {
            return Err(RhiError::RecorderClosed);
        };
        let (commands, declarations) = pool.take_storage();
        log::trace!("begin recording {}", self.label);
        Ok(RecordingSession {
            recorder: self,
            pool: Some(pool),
            commands,
            declarations,
            referenced: IndexSet::new(),
            states: HashMap::new(),
            serial: 0,
            rendering: None,
            pipeline: None,
            index_bound: false,
            label_depth: 0,
        })
    }
}
// getters
impl CommandRecorder {
    #[inline]
    pub fn frame(&self) -> FrameIndex {
        self.frame
    }

    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.pool.is_none()
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            self.device.release_pool(self.frame, pool);
        }
    }
}

/// 当前打开的 rendering 区间
#[derive(Clone, Copy, Debug)]
struct RenderingScope {
    /// BeginRendering 在 commands 中的位置
    begin_index: usize,
    begin_serial: usize,
}

#[derive(Clone, Debug)]
struct BoundPipeline {
    compute: bool,
    set_layouts: Vec<DescriptorSetLayout>,
    push_constant_size: u32,
}

/// 一次录制
///
/// 录制出错时命令不会被记录，session 仍然可以继续使用。
pub struct RecordingSession<'a> {
    recorder: &'a mut CommandRecorder,
    pool: Option<CommandPool>,

    commands: Vec<Command>,
    declarations: Vec<AccessDeclaration>,
    referenced: IndexSet<RawHandle>,

    /// stream 内每个资源的同步状态，用于推导 stream 内部的 barrier
    states: HashMap<RawHandle, ResourceSyncState>,
    /// 已经录制的命令数（不含 barrier）
    serial: usize,

    rendering: Option<RenderingScope>,
    pipeline: Option<BoundPipeline>,
    index_bound: bool,
    label_depth: u32,
}
// getters
impl RecordingSession<'_> {
    #[inline]
    pub fn frame(&self) -> FrameIndex {
        self.recorder.frame
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.recorder.queue
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn is_rendering(&self) -> bool {
        self.rendering.is_some()
    }

    #[inline]
    fn device(&self) -> &DeviceShared {
        &self.recorder.device
    }
}
// 内部工具
impl RecordingSession<'_> {
    fn require_queue(&self, allowed: &[QueueKind], what: &str) -> RhiResult<()> {
        if allowed.contains(&self.recorder.queue) {
            Ok(())
        } else {
            Err(RhiError::invalid_command(format!("{what} is not supported on the {} queue", self.recorder.queue)))
        }
    }

    fn require_outside_rendering(&self, what: &str) -> RhiResult<()> {
        if self.rendering.is_some() {
            Err(RhiError::invalid_command(format!("{what} inside rendering")))
        } else {
            Ok(())
        }
    }

    fn check_buffer(&self, buffer: BufferHandle, usage: BufferUsage) -> RhiResult<u64> {
        let table = self.device().table.read();
        let (_, desc) = table.buffer(buffer)?;
        if !desc.usage.contains(usage) {
            return Err(RhiError::invalid_command(format!("buffer '{}' lacks usage {usage:?}", desc.label)));
        }
        Ok(desc.size)
    }

    /// 返回 image 的 (width, height, base level 字节数, 是否是深度格式)
    fn check_image(&self, image: ImageHandle, usage: ImageUsage) -> RhiResult<(u32, u32, u64, bool)> {
        let table = self.device().table.read();
        let (_, desc) = table.image(image)?;
        if !desc.usage.contains(usage) {
            return Err(RhiError::invalid_command(format!("image '{}' lacks usage {usage:?}", desc.label)));
        }
        Ok((desc.extent.width, desc.extent.height, desc.base_level_size(), desc.format.is_depth()))
    }

    /// 记录一条命令（None 表示只有访问声明），并为冲突的访问插入 barrier
    fn record(&mut self, command: Option<Command>, declarations: Vec<AccessDeclaration>) {
        let serial = self.serial;
        self.serial += 1;
        let granularity = self.device().config.sync.granularity;
        let queue = self.recorder.queue;

        for decl in declarations {
            self.referenced.insert(decl.resource);
            let access = StreamAccess::from_declaration(&decl);
            self.declarations.push(decl);

            let state = match self.states.entry(access.resource) {
                Entry::Occupied(entry) => entry.into_mut(),
                // 第一次访问不在 stream 内同步，由提交时的同步推导处理
                Entry::Vacant(entry) => entry.insert(ResourceSyncState::fresh(access.entry_layout)),
            };
            let writers = state.last_write.as_ref().map(|w| w.origins.clone()).unwrap_or_default();
            let Some((hazard, producers, request)) =
                state.apply(Origin::Stream(serial), queue, &access, Scope::default(), granularity)
            else {
                continue;
            };

            // 同一条命令内部的多次声明
            if producers.iter().all(|p| *p == Origin::Stream(serial)) {
                continue;
            }
            let producers = if hazard == HazardKind::ReadAfterWrite { writers } else { producers };
            self.place_barrier(&producers, request);
        }

        if let Some(command) = command {
            self.commands.push(command);
        }
    }

    /// rendering 中不能插入 barrier：来源都在 rendering 之前时提前到 BeginRendering 之前
    fn place_barrier(&mut self, producers: &[Origin], request: BarrierRequest) {
        let command = Command::Barrier(request);
        match &mut self.rendering {
            Some(scope) => {
                let begin_serial = scope.begin_serial;
                let hoistable = producers.iter().all(|p| matches!(p, Origin::Stream(s) if *s < begin_serial));
                if hoistable {
                    self.commands.insert(scope.begin_index, command);
                    scope.begin_index += 1;
                } else {
                    log::warn!("{}: barrier inside rendering, the access depends on work in the same pass", self.recorder.label);
                    self.commands.push(command);
                }
            }
            None => self.commands.push(command),
        }
    }
}
// pipeline & 绑定
impl RecordingSession<'_> {
    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) -> RhiResult<()> {
        let bound = {
            let table = self.device().table.read();
            let desc = table.pipeline(pipeline)?;
            BoundPipeline {
                compute: desc.is_compute(),
                set_layouts: desc.set_layouts.clone(),
                push_constant_size: desc.push_constant_size,
            }
        };
        if bound.compute {
            self.require_queue(&[QueueKind::Graphics, QueueKind::Compute], "compute pipeline")?;
            self.require_outside_rendering("binding a compute pipeline")?;
        } else {
            self.require_queue(&[QueueKind::Graphics], "graphics pipeline")?;
        }

        self.referenced.insert(pipeline.raw());
        self.record(Some(Command::BindPipeline(pipeline)), Vec::new());
        self.pipeline = Some(bound);
        Ok(())
    }

    /// 绑定 descriptor set，并为其中的每个资源登记访问
    ///
    /// stage 取自 pipeline 的 set layout；layout 中没有这个 binding 时，
    /// compute pipeline 使用 COMPUTE_SHADER，graphics pipeline 使用 VERTEX_SHADER | FRAGMENT_SHADER。
    pub fn bind_descriptor_set(&mut self, set_index: u32, set: DescriptorSetHandle) -> RhiResult<()> {
        let Some(pipeline) = &self.pipeline else {
            return Err(RhiError::invalid_command("bind_descriptor_set without a bound pipeline"));
        };
        if !pipeline.set_layouts.is_empty() && set_index as usize >= pipeline.set_layouts.len() {
            return Err(RhiError::invalid_command(format!(
                "set index {set_index} exceeds the {} set layouts of the pipeline",
                pipeline.set_layouts.len()
            )));
        }
        let layout = pipeline.set_layouts.get(set_index as usize);
        let default_stages = if pipeline.compute {
            PipelineStages::COMPUTE_SHADER
        } else {
            PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER
        };

        let mut declarations = Vec::new();
        let mut samplers = Vec::new();
        {
            let table = self.device().table.read();
            let desc = table.descriptor_set(set)?;
            for binding in &desc.bindings {
                let stages = layout
                    .and_then(|l| l.bindings.iter().find(|b| b.binding == binding.binding))
                    .map_or(default_stages, |b| b.stages);
                let decl = match binding.resource {
                    DescriptorResource::UniformBuffer(buffer) => {
                        table.resolve(buffer)?;
                        AccessDeclaration::read(buffer, stages)
                    }
                    DescriptorResource::StorageBuffer { buffer, writable } => {
                        table.resolve(buffer)?;
                        let kind = if writable { AccessKind::ReadWrite } else { AccessKind::Read };
                        AccessDeclaration::new(buffer, Some(kind), stages)
                    }
                    DescriptorResource::SampledImage { image, sampler } => {
                        table.resolve(image)?;
                        table.resolve(sampler)?;
                        samplers.push(sampler.raw());
                        AccessDeclaration::read(image, stages)
                    }
                    DescriptorResource::StorageImage { image, writable } => {
                        table.resolve(image)?;
                        let kind = if writable { AccessKind::ReadWrite } else { AccessKind::Read };
                        AccessDeclaration::new(image, Some(kind), stages).with_layout(ImageLayout::General)
                    }
                };
                declarations.push(decl);
            }
        }

        self.referenced.insert(set.raw());
        self.referenced.extend(samplers);
        self.record(Some(Command::BindDescriptorSet { set_index, set }), declarations);
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferHandle, offset: u64) -> RhiResult<()> {
        self.require_queue(&[QueueKind::Graphics], "bind_vertex_buffer")?;
        let size = self.check_buffer(buffer, BufferUsage::VERTEX)?;
        if offset >= size {
            return Err(RhiError::InvalidRange { offset, size: 0, len: size });
        }
        let decl = AccessDeclaration::read(buffer, PipelineStages::VERTEX_INPUT).with_range(offset..size);
        self.record(Some(Command::BindVertexBuffer { binding, buffer, offset }), vec![decl]);
        Ok(())
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) -> RhiResult<()> {
        self.require_queue(&[QueueKind::Graphics], "bind_index_buffer")?;
        let size = self.check_buffer(buffer, BufferUsage::INDEX)?;
        if offset >= size || offset % index_type.size() != 0 {
            return Err(RhiError::InvalidRange { offset, size: 0, len: size });
        }
        let decl = AccessDeclaration::read(buffer, PipelineStages::VERTEX_INPUT).with_range(offset..size);
        self.record(
            Some(Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            }),
            vec![decl],
        );
        self.index_bound = true;
        Ok(())
    }

    /// offset 和长度都必须是 4 的倍数，并且落在 pipeline 声明的 push constant 范围内
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) -> RhiResult<()> {
        let Some(pipeline) = &self.pipeline else {
            return Err(RhiError::invalid_command("push_constants without a bound pipeline"));
        };
        let size = data.len() as u64;
        if data.is_empty() || offset % 4 != 0 || size % 4 != 0 {
            return Err(RhiError::invalid_command(format!(
                "push constant offset {offset} and size {size} must be non-zero multiples of 4"
            )));
        }
        RhiError::check_range(offset as u64, size, pipeline.push_constant_size as u64)?;
        self.record(
            Some(Command::PushConstants {
                offset,
                data: data.to_vec(),
            }),
            Vec::new(),
        );
        Ok(())
    }
}
// rendering & draw
impl RecordingSession<'_> {
    pub fn begin_rendering(&mut self, info: RenderingInfo) -> RhiResult<()> {
        self.require_queue(&[QueueKind::Graphics], "begin_rendering")?;
        self.require_outside_rendering("begin_rendering")?;
        if info.color.is_empty() && info.depth.is_none() {
            return Err(RhiError::invalid_command("rendering without attachments"));
        }
        if info.extent.width == 0 || info.extent.height == 0 {
            return Err(RhiError::invalid_command("rendering extent must be non-zero"));
        }

        let check_extent = |width: u32, height: u32| -> RhiResult<()> {
            if info.extent.width > width || info.extent.height > height {
                Err(RhiError::invalid_command(format!(
                    "render area {}x{} exceeds attachment {width}x{height}",
                    info.extent.width, info.extent.height
                )))
            } else {
                Ok(())
            }
        };
        let load_kind = |attachment: &Attachment| match attachment.load {
            LoadOp::Load => AccessKind::ReadWrite,
            LoadOp::Clear(_) | LoadOp::DontCare => AccessKind::Write,
        };

        let mut declarations = Vec::with_capacity(info.color.len() + 1);
        for attachment in &info.color {
            let (width, height, _, _) = self.check_image(attachment.image, ImageUsage::COLOR_ATTACHMENT)?;
            check_extent(width, height)?;
            declarations.push(AccessDeclaration::new(
                attachment.image,
                Some(load_kind(attachment)),
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            ));
        }
        if let Some(depth) = &info.depth {
            let (width, height, _, _) = self.check_image(depth.image, ImageUsage::DEPTH_STENCIL_ATTACHMENT)?;
            check_extent(width, height)?;
            declarations.push(AccessDeclaration::new(
                depth.image,
                Some(AccessKind::ReadWrite),
                PipelineStages::FRAGMENT_TESTS,
            ));
        }

        let begin_serial = self.serial;
        self.record(Some(Command::BeginRendering(info)), declarations);
        self.rendering = Some(RenderingScope {
            begin_index: self.commands.len() - 1,
            begin_serial,
        });
        Ok(())
    }

    pub fn end_rendering(&mut self) -> RhiResult<()> {
        if self.rendering.is_none() {
            return Err(RhiError::invalid_command("end_rendering without begin_rendering"));
        }
        self.record(Some(Command::EndRendering), Vec::new());
        self.rendering = None;
        Ok(())
    }

    fn require_draw_state(&self, what: &str) -> RhiResult<()> {
        if self.rendering.is_none() {
            return Err(RhiError::invalid_command(format!("{what} outside rendering")));
        }
        match &self.pipeline {
            Some(pipeline) if !pipeline.compute => Ok(()),
            _ => Err(RhiError::invalid_command(format!("{what} without a graphics pipeline"))),
        }
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) -> RhiResult<()> {
        self.require_draw_state("draw")?;
        self.record(Some(Command::Draw { vertices, instances }), Vec::new());
        Ok(())
    }

    pub fn draw_indexed(&mut self, indices: Range<u32>, vertex_offset: i32, instances: Range<u32>) -> RhiResult<()> {
        self.require_draw_state("draw_indexed")?;
        if !self.index_bound {
            return Err(RhiError::invalid_command("draw_indexed without an index buffer"));
        }
        self.record(
            Some(Command::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            }),
            Vec::new(),
        );
        Ok(())
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) -> RhiResult<()> {
        self.require_outside_rendering("dispatch")?;
        match &self.pipeline {
            Some(pipeline) if pipeline.compute => {}
            _ => return Err(RhiError::invalid_command("dispatch without a compute pipeline")),
        }
        self.record(Some(Command::Dispatch { groups }), Vec::new());
        Ok(())
    }
}
// transfer
impl RecordingSession<'_> {
    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        self.require_outside_rendering("copy_buffer")?;
        let src_len = self.check_buffer(src, BufferUsage::TRANSFER_SRC)?;
        let dst_len = self.check_buffer(dst, BufferUsage::TRANSFER_DST)?;
        if size == 0 {
            return Err(RhiError::InvalidRange {
                offset: src_offset,
                size,
                len: src_len,
            });
        }
        RhiError::check_range(src_offset, size, src_len)?;
        RhiError::check_range(dst_offset, size, dst_len)?;
        if src == dst && src_offset < dst_offset + size && dst_offset < src_offset + size {
            return Err(RhiError::invalid_command("copy_buffer with overlapping source and destination"));
        }

        let declarations = vec![
            AccessDeclaration::read(src, PipelineStages::TRANSFER).with_range(src_offset..src_offset + size),
            AccessDeclaration::write(dst, PipelineStages::TRANSFER).with_range(dst_offset..dst_offset + size),
        ];
        self.record(
            Some(Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            }),
            declarations,
        );
        Ok(())
    }

    /// 拷贝 image 的整个 base level，buffer 中的数据紧密排列
    pub fn copy_buffer_to_image(&mut self, src: BufferHandle, src_offset: u64, dst: ImageHandle) -> RhiResult<()> {
        self.require_outside_rendering("copy_buffer_to_image")?;
        let src_len = self.check_buffer(src, BufferUsage::TRANSFER_SRC)?;
        let (_, _, size, _) = self.check_image(dst, ImageUsage::TRANSFER_DST)?;
        RhiError::check_range(src_offset, size, src_len)?;

        let declarations = vec![
            AccessDeclaration::read(src, PipelineStages::TRANSFER).with_range(src_offset..src_offset + size),
            AccessDeclaration::write(dst, PipelineStages::TRANSFER),
        ];
        self.record(Some(Command::CopyBufferToImage { src, src_offset, dst }), declarations);
        Ok(())
    }

    pub fn copy_image_to_buffer(&mut self, src: ImageHandle, dst: BufferHandle, dst_offset: u64) -> RhiResult<()> {
        self.require_outside_rendering("copy_image_to_buffer")?;
        let (_, _, size, _) = self.check_image(src, ImageUsage::TRANSFER_SRC)?;
        let dst_len = self.check_buffer(dst, BufferUsage::TRANSFER_DST)?;
        RhiError::check_range(dst_offset, size, dst_len)?;

        let declarations = vec![
            AccessDeclaration::read(src, PipelineStages::TRANSFER),
            AccessDeclaration::write(dst, PipelineStages::TRANSFER).with_range(dst_offset..dst_offset + size),
        ];
        self.record(Some(Command::CopyImageToBuffer { src, dst, dst_offset }), declarations);
        Ok(())
    }

    /// 用 u32 重复填充，offset 和 size 必须是 4 的倍数
    pub fn fill_buffer(&mut self, dst: BufferHandle, offset: u64, size: u64, value: u32) -> RhiResult<()> {
        self.require_outside_rendering("fill_buffer")?;
        let len = self.check_buffer(dst, BufferUsage::TRANSFER_DST)?;
        if size == 0 || offset % 4 != 0 || size % 4 != 0 {
            return Err(RhiError::invalid_command(format!(
                "fill_buffer offset {offset} and size {size} must be non-zero multiples of 4"
            )));
        }
        RhiError::check_range(offset, size, len)?;

        let decl = AccessDeclaration::write(dst, PipelineStages::TRANSFER).with_range(offset..offset + size);
        self.record(Some(Command::FillBuffer { dst, offset, size, value }), vec![decl]);
        Ok(())
    }

    pub fn clear_image(&mut self, image: ImageHandle, value: ClearValue) -> RhiResult<()> {
        self.require_queue(&[QueueKind::Graphics, QueueKind::Compute], "clear_image")?;
        self.require_outside_rendering("clear_image")?;
        let (_, _, _, is_depth) = self.check_image(image, ImageUsage::TRANSFER_DST)?;
        match (is_depth, value) {
            (false, ClearValue::Color(_)) | (true, ClearValue::DepthStencil { .. }) => {}
            _ => return Err(RhiError::invalid_command("clear value does not match the image format")),
        }

        let decl = AccessDeclaration::write(image, PipelineStages::TRANSFER);
        self.record(Some(Command::ClearImage { image, value }), vec![decl]);
        Ok(())
    }

    /// 通过这一帧的 staging belt 上传数据
    pub fn upload_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        let _span = crate::rhi_span!("RecordingSession::upload_buffer");
        self.require_outside_rendering("upload_buffer")?;
        let len = self.check_buffer(dst, BufferUsage::TRANSFER_DST)?;
        let size = data.len() as u64;
        if size == 0 {
            return Err(RhiError::InvalidRange { offset, size, len });
        }
        RhiError::check_range(offset, size, len)?;

        let region = self.recorder.device.stage_bytes(self.recorder.frame, data)?;
        self.copy_buffer(region.buffer, region.offset, dst, offset, size)
    }

    /// data 必须正好是 base level 的大小
    pub fn upload_image(&mut self, dst: ImageHandle, data: &[u8]) -> RhiResult<()> {
        let _span = crate::rhi_span!("RecordingSession::upload_image");
        self.require_outside_rendering("upload_image")?;
        let (_, _, expected, _) = self.check_image(dst, ImageUsage::TRANSFER_DST)?;
        if data.len() as u64 != expected {
            return Err(RhiError::InvalidRange {
                offset: 0,
                size: data.len() as u64,
                len: expected,
            });
        }

        let region = self.recorder.device.stage_bytes(self.recorder.frame, data)?;
        self.copy_buffer_to_image(region.buffer, region.offset, dst)
    }
}
// 声明 & 调试
impl RecordingSession<'_> {
    /// 只登记访问，不记录命令
    ///
    /// kind 为 None 时按读写处理。
    pub fn bind_resource(
        &mut self,
        resource: impl Into<RawHandle>,
        kind: Option<AccessKind>,
        stages: PipelineStages,
    ) -> RhiResult<()> {
        let resource = resource.into();
        self.device().table.read().resolve_raw(resource)?;
        self.record(None, vec![AccessDeclaration::new(resource, kind, stages)]);
        Ok(())
    }

    /// 把 image 转换到可以呈现的状态，必须是它在这一帧中的最后一次访问
    pub fn prepare_present(&mut self, image: ImageHandle) -> RhiResult<()> {
        self.require_queue(&[QueueKind::Graphics, QueueKind::Compute], "prepare_present")?;
        self.require_outside_rendering("prepare_present")?;
        self.device().table.read().image(image)?;

        let decl = AccessDeclaration::read(image, PipelineStages::BOTTOM_OF_PIPE).with_layout(ImageLayout::Present);
        self.record(None, vec![decl]);
        Ok(())
    }

    pub fn begin_label(&mut self, label: impl Into<String>) {
        self.commands.push(Command::BeginLabel(label.into()));
        self.label_depth += 1;
    }

    pub fn end_label(&mut self) -> RhiResult<()> {
        if self.label_depth == 0 {
            return Err(RhiError::invalid_command("end_label without begin_label"));
        }
        self.commands.push(Command::EndLabel);
        self.label_depth -= 1;
        Ok(())
    }
}
// end
impl RecordingSession<'_> {
    /// 结束录制，得到可以提交的 stream
    pub fn end(mut self) -> RhiResult<CommandStream> {
        if self.rendering.is_some() {
            return Err(RhiError::invalid_command("end with an open rendering"));
        }
        if self.label_depth != 0 {
            return Err(RhiError::invalid_command(format!("end with {} open labels", self.label_depth)));
        }
        let Some(pool) = self.pool.take() else {
            return Err(RhiError::RecorderClosed);
        };

        let commands = std::mem::take(&mut self.commands);
        let declarations = std::mem::take(&mut self.declarations);
        let accesses = summarize(&declarations);
        let recorder = &*self.recorder;
        log::trace!(
            "end recording {}: {} commands, {} resources",
            recorder.label,
            commands.len(),
            accesses.len()
        );
        Ok(CommandStream {
            frame: recorder.frame,
            queue: recorder.queue,
            worker: recorder.worker,
            label: recorder.label.clone(),
            commands,
            declarations,
            accesses,
            referenced: std::mem::take(&mut self.referenced),
            pool,
        })
    }
}

impl Drop for RecordingSession<'_> {
    fn drop(&mut self) {
        // 没有 end 的录制：丢弃命令，pool 直接归还
        if let Some(mut pool) = self.pool.take() {
            pool.restore_storage(std::mem::take(&mut self.commands), std::mem::take(&mut self.declarations));
            self.recorder.device.release_pool(self.recorder.frame, pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::command::Attachment;
    use crate::config::RhiConfig;
    use crate::device::Device;
    use crate::resource::desc::{
        BufferDesc, Extent2d, Format, ImageDesc, MemoryLocality, PipelineDesc, PipelineKind, PrimitiveTopology,
        ShaderDesc, VertexLayout,
    };

    fn graphics_pipeline(device: &Device) -> PipelineHandle {
        let desc = PipelineDesc {
            kind: PipelineKind::Graphics {
                vertex: ShaderDesc::new(PipelineStages::VERTEX_SHADER, "main", vec![0; 4]),
                fragment: Some(ShaderDesc::new(PipelineStages::FRAGMENT_SHADER, "main", vec![0; 4])),
                vertex_layouts: vec![VertexLayout {
                    stride: 16,
                    attributes: Vec::new(),
                }],
                topology: PrimitiveTopology::TriangleList,
                color_formats: vec![Format::Rgba8Unorm],
                depth_format: None,
            },
            set_layouts: Vec::new(),
            push_constant_size: 16,
            label: "gfx".to_string(),
        };
        device.create_pipeline(desc).unwrap()
    }

    fn buffer(device: &Device, usage: BufferUsage) -> BufferHandle {
        device
            .create_buffer(BufferDesc::new(256, usage, MemoryLocality::DeviceLocal, "buffer"))
            .unwrap()
    }

    fn target(device: &Device) -> ImageHandle {
        let desc = ImageDesc::new_2d(8, 8, Format::Rgba8Unorm, ImageUsage::COLOR_ATTACHMENT, "target");
        device.create_image(desc).unwrap()
    }

    #[test]
    fn test_recorder_records_once() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let frame = device.begin_frame().unwrap();
        let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();

        assert!(matches!(recorder.begin(frame.next()), Err(RhiError::FrameNotActive(_))));
        let session = recorder.begin(frame).unwrap();
        drop(session);
        assert!(matches!(recorder.begin(frame), Err(RhiError::RecorderClosed)));
        assert!(recorder.is_closed());
    }

    #[test]
    fn test_conflicting_accesses_in_one_stream_get_barrier() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let a = buffer(&device, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST);
        let b = buffer(&device, BufferUsage::TRANSFER_DST);
        let frame = device.begin_frame().unwrap();
        let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
        let mut session = recorder.begin(frame).unwrap();

        session.fill_buffer(a, 0, 256, 7).unwrap();
        session.copy_buffer(a, 0, b, 0, 256).unwrap();
        // 只读访问之间不需要 barrier
        session.bind_resource(a, Some(AccessKind::Read), PipelineStages::TRANSFER).unwrap();
        let stream = session.end().unwrap();

        assert_eq!(stream.barrier_count(), 1);
        let Command::Barrier(request) = &stream.commands()[1] else {
            panic!("expected a barrier before the copy");
        };
        assert_eq!(request.resource, a.raw());
        assert_eq!(request.hazard, HazardKind::ReadAfterWrite);
        assert_eq!(stream.accesses().len(), 2);
    }

    #[test]
    fn test_barrier_is_hoisted_out_of_rendering() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let vertices = buffer(&device, BufferUsage::VERTEX | BufferUsage::TRANSFER_DST);
        let pipeline = graphics_pipeline(&device);
        let image = target(&device);

        let frame = device.begin_frame().unwrap();
        let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
        let mut session = recorder.begin(frame).unwrap();
        session.fill_buffer(vertices, 0, 256, 0).unwrap();
        session
            .begin_rendering(RenderingInfo {
                extent: Extent2d::new(8, 8),
                color: vec![Attachment::clear(image, ClearValue::Color([0.0; 4]))],
                depth: None,
            })
            .unwrap();
        session.bind_pipeline(pipeline).unwrap();
        session.bind_vertex_buffer(0, vertices, 0).unwrap();
        session.draw(0..3, 0..1).unwrap();
        session.end_rendering().unwrap();
        let stream = session.end().unwrap();

        let names: Vec<_> = stream
            .commands()
            .iter()
            .map(|c| match c {
                Command::FillBuffer { .. } => "fill",
                Command::Barrier(_) => "barrier",
                Command::BeginRendering(_) => "begin",
                Command::BindPipeline(_) => "pipeline",
                Command::BindVertexBuffer { .. } => "vertex",
                Command::Draw { .. } => "draw",
                Command::EndRendering => "end",
                _ => "other",
            })
            .collect();
        assert_eq!(names, ["fill", "barrier", "begin", "pipeline", "vertex", "draw", "end"]);
    }

    #[test]
    fn test_protocol_errors() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let pipeline = graphics_pipeline(&device);
        let image = target(&device);
        let frame = device.begin_frame().unwrap();
        let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
        let mut session = recorder.begin(frame).unwrap();

        assert!(matches!(session.draw(0..3, 0..1), Err(RhiError::InvalidCommand(_))));
        assert!(matches!(session.push_constants(0, &[0; 4]), Err(RhiError::InvalidCommand(_))));
        session.bind_pipeline(pipeline).unwrap();
        assert!(session.push_constants(0, &[0; 16]).is_ok());
        assert!(matches!(session.push_constants(8, &[0; 16]), Err(RhiError::InvalidRange { .. })));
        assert!(matches!(session.push_constants(0, &[0; 3]), Err(RhiError::InvalidCommand(_))));
        assert!(matches!(session.dispatch([1, 1, 1]), Err(RhiError::InvalidCommand(_))));
        assert!(matches!(session.end_label(), Err(RhiError::InvalidCommand(_))));

        session
            .begin_rendering(RenderingInfo {
                extent: Extent2d::new(16, 16),
                color: vec![Attachment::load(image)],
                depth: None,
            })
            .unwrap_err();
        session
            .begin_rendering(RenderingInfo {
                extent: Extent2d::new(8, 8),
                color: vec![Attachment::load(image)],
                depth: None,
            })
            .unwrap();
        assert!(matches!(session.end(), Err(RhiError::InvalidCommand(_))));
    }

    #[test]
    fn test_transfer_queue_rejects_graphics_work() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let pipeline = graphics_pipeline(&device);
        let frame = device.begin_frame().unwrap();
        let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Transfer).unwrap();
        let mut session = recorder.begin(frame).unwrap();
        assert!(matches!(session.bind_pipeline(pipeline), Err(RhiError::InvalidCommand(_))));
    }

    #[test]
    fn test_upload_goes_through_staging() {
        let (device, _) = Device::headless(RhiConfig::default()).unwrap();
        let dst = buffer(&device, BufferUsage::TRANSFER_DST);
        let frame = device.begin_frame().unwrap();
        let mut recorder = device.acquire_recorder(frame, WorkerId(1), QueueKind::Graphics).unwrap();
        let mut session = recorder.begin(frame).unwrap();

        assert!(matches!(session.upload_buffer(dst, 0, &[]), Err(RhiError::InvalidRange { .. })));
        assert!(matches!(session.upload_buffer(dst, 200, &[0; 100]), Err(RhiError::InvalidRange { .. })));
        session.upload_buffer(dst, 16, &[1; 64]).unwrap();
        let stream = session.end().unwrap();

        let Command::CopyBuffer { dst: copy_dst, dst_offset, size, .. } = &stream.commands()[0] else {
            panic!("upload should record a copy");
        };
        assert_eq!((*copy_dst, *dst_offset, *size), (dst, 16, 64));
        // staging buffer + 目标 buffer
        assert_eq!(stream.referenced().count(), 2);
    }
}
