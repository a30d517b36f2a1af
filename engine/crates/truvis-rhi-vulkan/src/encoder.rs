//! ResolvedCommand 到 vkCmd* 的翻译

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use itertools::Itertools;
use truvis_rhi::backend::{
    CommandEncoder, EncodedCommands, ObjectId, ResolvedAttachment, ResolvedBarrier, ResolvedCommand,
};
use truvis_rhi::commands::ClearValue;
use truvis_rhi::resource::handles::ResourceType;
use truvis_rhi::{QueueKind, RhiError, RhiResult};

use crate::backend::VulkanShared;
use crate::convert::{self, vk_error};
use crate::objects::VulkanObject;

/// 编码完成的 command buffer，交给 VulkanQueue 提交
pub(crate) struct VulkanCommands {
    pub(crate) command_buffer: vk::CommandBuffer,
}

/// debug label 的颜色
const LABEL_COLOR: [f32; 4] = [0.4, 0.7, 1.0, 1.0];

pub(crate) struct VulkanEncoder {
    shared: Arc<VulkanShared>,
    command_buffer: vk::CommandBuffer,
    queue: QueueKind,

    /// 当前绑定的 pipeline 的 layout 和 bind point
    bound_layout: Option<(vk::PipelineLayout, vk::PipelineBindPoint)>,
}

// new & init
impl VulkanEncoder {
    pub(crate) fn new(shared: Arc<VulkanShared>, queue: QueueKind, command_buffer: vk::CommandBuffer) -> RhiResult<Self> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { shared.device.device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(|e| vk_error("begin command buffer", e))?;
        Ok(Self {
            shared,
            command_buffer,
            queue,
            bound_layout: None,
        })
    }
}
// tools
impl VulkanEncoder {
    #[inline]
    fn device(&self) -> &ash::Device {
        &self.shared.device.device
    }

    fn with_object<R>(&self, id: ObjectId, f: impl FnOnce(&VulkanObject) -> Option<R>) -> RhiResult<R> {
        let objects = self.shared.objects.read();
        objects
            .get(&id)
            .and_then(f)
            .ok_or_else(|| RhiError::Backend(format!("object {id:?} is missing or has a wrong type")))
    }

    fn buffer(&self, id: ObjectId) -> RhiResult<vk::Buffer> {
        self.with_object(id, |object| match object {
            VulkanObject::Buffer { buffer } => Some(*buffer),
            _ => None,
        })
    }

    /// (image, view, aspect, extent, layers, mips)
    fn image(&self, id: ObjectId) -> RhiResult<(vk::Image, vk::ImageView, vk::ImageAspectFlags, vk::Extent3D, u32, u32)> {
        self.with_object(id, |object| match object {
            VulkanObject::Image {
                image,
                view,
                aspect,
                extent,
                array_layers,
                mip_levels,
                ..
            } => Some((*image, *view, *aspect, *extent, *array_layers, *mip_levels)),
            _ => None,
        })
    }

    fn bound_layout(&self) -> RhiResult<(vk::PipelineLayout, vk::PipelineBindPoint)> {
        self.bound_layout
            .ok_or_else(|| RhiError::InvalidCommand("no pipeline is bound".to_string()))
    }

    /// buffer <-> image 拷贝的区域：整个 base mip level
    fn copy_region(
        &self,
        buffer_offset: u64,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent3D,
        layers: u32,
    ) -> vk::BufferImageCopy {
        // depth stencil image 一次只能拷贝一个 aspect
        let aspect = if aspect.contains(vk::ImageAspectFlags::DEPTH) { vk::ImageAspectFlags::DEPTH } else { aspect };
        vk::BufferImageCopy::default()
            .buffer_offset(buffer_offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(layers),
            )
            .image_extent(extent)
    }

    fn attachment_info(
        &self,
        attachment: &ResolvedAttachment,
        layout: vk::ImageLayout,
    ) -> RhiResult<vk::RenderingAttachmentInfo<'static>> {
        let (_, view, ..) = self.image(attachment.image)?;
        let (load_op, clear_value) = convert::load_op(attachment.load);
        let store_op = if attachment.store { vk::AttachmentStoreOp::STORE } else { vk::AttachmentStoreOp::DONT_CARE };
        Ok(vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(layout)
            .load_op(load_op)
            .store_op(store_op)
            .clear_value(clear_value))
    }

    fn barrier(&self, barrier: &ResolvedBarrier) -> RhiResult<()> {
        let src_stage = convert::stages(barrier.src.stages);
        let dst_stage = convert::stages(barrier.dst.stages);
        // 没有任何前序访问时从 TOP_OF_PIPE 开始
        let src_stage = if src_stage.is_empty() { vk::PipelineStageFlags2::TOP_OF_PIPE } else { src_stage };
        let dst_stage = if dst_stage.is_empty() { vk::PipelineStageFlags2::BOTTOM_OF_PIPE } else { dst_stage };
        let src_access = convert::access(barrier.src.access);
        let dst_access = convert::access(barrier.dst.access);

        match barrier.resource_type {
            ResourceType::Buffer => {
                let buffer = self.buffer(barrier.object)?;
                let (offset, size) = match &barrier.range {
                    Some(range) => (range.start, range.end - range.start),
                    None => (0, vk::WHOLE_SIZE),
                };
                let barriers = [vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer)
                    .offset(offset)
                    .size(size)];
                let dependency_info = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
                unsafe { self.device().cmd_pipeline_barrier2(self.command_buffer, &dependency_info) };
            }
            ResourceType::Image => {
                let (image, _, aspect, _, layers, mips) = self.image(barrier.object)?;
                let barriers = [vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .old_layout(convert::layout(barrier.old_layout))
                    .new_layout(convert::layout(barrier.new_layout))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(VulkanObject::subresource_range(aspect, mips, layers))];
                let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe { self.device().cmd_pipeline_barrier2(self.command_buffer, &dependency_info) };
            }
            _ => {
                let barriers = [vk::MemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)];
                let dependency_info = vk::DependencyInfo::default().memory_barriers(&barriers);
                unsafe { self.device().cmd_pipeline_barrier2(self.command_buffer, &dependency_info) };
            }
        }
        Ok(())
    }
}

impl CommandEncoder for VulkanEncoder {
    fn encode(&mut self, command: &ResolvedCommand) -> RhiResult<()> {
        let cmd = self.command_buffer;
        match command {
            ResolvedCommand::BindPipeline { pipeline, .. } => {
                let (pipeline, layout, bind_point) = self.with_object(*pipeline, |object| match object {
                    VulkanObject::Pipeline {
                        pipeline,
                        layout,
                        bind_point,
                        ..
                    } => Some((*pipeline, *layout, *bind_point)),
                    _ => None,
                })?;
                unsafe { self.device().cmd_bind_pipeline(cmd, bind_point, pipeline) };
                self.bound_layout = Some((layout, bind_point));
            }
            ResolvedCommand::BindDescriptorSet { set_index, set, .. } => {
                let (layout, bind_point) = self.bound_layout()?;
                let set = self.with_object(*set, |object| match object {
                    VulkanObject::DescriptorSet { set, .. } => Some(*set),
                    _ => None,
                })?;
                unsafe { self.device().cmd_bind_descriptor_sets(cmd, bind_point, layout, *set_index, &[set], &[]) };
            }
            ResolvedCommand::BindVertexBuffer { binding, buffer, offset } => {
                let buffer = self.buffer(*buffer)?;
                unsafe { self.device().cmd_bind_vertex_buffers(cmd, *binding, &[buffer], &[*offset]) };
            }
            ResolvedCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => {
                let buffer = self.buffer(*buffer)?;
                unsafe { self.device().cmd_bind_index_buffer(cmd, buffer, *offset, convert::index_type(*index_type)) };
            }
            ResolvedCommand::PushConstants { offset, data } => {
                let (layout, _) = self.bound_layout()?;
                unsafe { self.device().cmd_push_constants(cmd, layout, vk::ShaderStageFlags::ALL, *offset, data) };
            }
            ResolvedCommand::BeginRendering { extent, color, depth } => {
                let color_infos = color
                    .iter()
                    .map(|a| self.attachment_info(a, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                    .collect::<RhiResult<Vec<_>>>()?;
                let depth_info = depth
                    .as_ref()
                    .map(|a| self.attachment_info(a, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL))
                    .transpose()?;

                let render_area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: extent.width,
                        height: extent.height,
                    },
                };
                let mut rendering_info = vk::RenderingInfo::default()
                    .render_area(render_area)
                    .layer_count(1)
                    .color_attachments(&color_infos);
                if let Some(depth_info) = depth_info.as_ref() {
                    rendering_info = rendering_info.depth_attachment(depth_info);
                }
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                unsafe {
                    self.device().cmd_begin_rendering(cmd, &rendering_info);
                    self.device().cmd_set_viewport(cmd, 0, &[viewport]);
                    self.device().cmd_set_scissor(cmd, 0, &[render_area]);
                }
            }
            ResolvedCommand::EndRendering => unsafe { self.device().cmd_end_rendering(cmd) },
            ResolvedCommand::Draw { vertices, instances } => unsafe {
                self.device().cmd_draw(
                    cmd,
                    vertices.len() as u32,
                    instances.len() as u32,
                    vertices.start,
                    instances.start,
                )
            },
            ResolvedCommand::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            } => unsafe {
                self.device().cmd_draw_indexed(
                    cmd,
                    indices.len() as u32,
                    instances.len() as u32,
                    indices.start,
                    *vertex_offset,
                    instances.start,
                )
            },
            ResolvedCommand::Dispatch { groups } => unsafe {
                self.device().cmd_dispatch(cmd, groups[0], groups[1], groups[2])
            },
            ResolvedCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let (src, dst) = (self.buffer(*src)?, self.buffer(*dst)?);
                let region = vk::BufferCopy::default().src_offset(*src_offset).dst_offset(*dst_offset).size(*size);
                unsafe { self.device().cmd_copy_buffer(cmd, src, dst, &[region]) };
            }
            ResolvedCommand::CopyBufferToImage { src, src_offset, dst } => {
                let src = self.buffer(*src)?;
                let (image, _, aspect, extent, layers, _) = self.image(*dst)?;
                let region = self.copy_region(*src_offset, aspect, extent, layers);
                unsafe {
                    self.device().cmd_copy_buffer_to_image(
                        cmd,
                        src,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            ResolvedCommand::CopyImageToBuffer { src, dst, dst_offset } => {
                let (image, _, aspect, extent, layers, _) = self.image(*src)?;
                let dst = self.buffer(*dst)?;
                let region = self.copy_region(*dst_offset, aspect, extent, layers);
                unsafe {
                    self.device().cmd_copy_image_to_buffer(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst,
                        &[region],
                    )
                };
            }
            ResolvedCommand::FillBuffer {
                dst,
                offset,
                size,
                value,
            } => {
                let dst = self.buffer(*dst)?;
                unsafe { self.device().cmd_fill_buffer(cmd, dst, *offset, *size, *value) };
            }
            ResolvedCommand::ClearImage { image, value } => {
                let (image, _, aspect, _, layers, mips) = self.image(*image)?;
                let range = VulkanObject::subresource_range(aspect, mips, layers);
                match *value {
                    ClearValue::Color(color) => unsafe {
                        self.device().cmd_clear_color_image(
                            cmd,
                            image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &vk::ClearColorValue { float32: color },
                            &[range],
                        )
                    },
                    ClearValue::DepthStencil { depth, stencil } => unsafe {
                        self.device().cmd_clear_depth_stencil_image(
                            cmd,
                            image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &vk::ClearDepthStencilValue { depth, stencil },
                            &[range],
                        )
                    },
                }
            }
            ResolvedCommand::Barrier(barrier) => self.barrier(barrier)?,
            ResolvedCommand::HostBarrier => {
                let barriers = [vk::MemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::HOST)
                    .dst_access_mask(vk::AccessFlags2::HOST_READ)];
                let dependency_info = vk::DependencyInfo::default().memory_barriers(&barriers);
                unsafe { self.device().cmd_pipeline_barrier2(cmd, &dependency_info) };
            }
            ResolvedCommand::BeginLabel(label) => {
                if let Some(debug_utils) = &self.shared.device.debug_utils {
                    let name = CString::new(label.as_str()).unwrap_or_default();
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name).color(LABEL_COLOR);
                    unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
                }
            }
            ResolvedCommand::EndLabel => {
                if let Some(debug_utils) = &self.shared.device.debug_utils {
                    unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
                }
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> RhiResult<EncodedCommands> {
        unsafe { self.device().end_command_buffer(self.command_buffer) }
            .map_err(|e| vk_error("end command buffer", e))?;
        log::trace!("{} encoder finished {:?}", self.queue, self.command_buffer);
        Ok(EncodedCommands::new(VulkanCommands {
            command_buffer: self.command_buffer,
        }))
    }
}

/// 一个帧槽位在一个 queue 上的 command pool
///
/// 槽位的 fence 完成之后整个 pool 一起 reset，command buffer 留着下次复用。
pub(crate) struct CommandPoolSlot {
    pub(crate) pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    used: Vec<vk::CommandBuffer>,
}

impl CommandPoolSlot {
    pub(crate) fn new(device: &ash::Device, family_index: u32) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default().queue_family_index(family_index);
        let pool =
            unsafe { device.create_command_pool(&create_info, None) }.map_err(|e| vk_error("create command pool", e))?;
        Ok(Self {
            pool,
            free: Vec::new(),
            used: Vec::new(),
        })
    }

    pub(crate) fn take(&mut self, device: &ash::Device) -> RhiResult<vk::CommandBuffer> {
        let command_buffer = match self.free.pop() {
            Some(command_buffer) => command_buffer,
            None => {
                let info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                unsafe { device.allocate_command_buffers(&info) }
                    .map_err(|e| vk_error("allocate command buffer", e))?
                    .into_iter()
                    .exactly_one()
                    .map_err(|_| RhiError::Backend("expected one command buffer".into()))?
            }
        };
        self.used.push(command_buffer);
        Ok(command_buffer)
    }

    pub(crate) fn reset(&mut self, device: &ash::Device) -> RhiResult<()> {
        unsafe { device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty()) }
            .map_err(|e| vk_error("reset command pool", e))?;
        self.free.append(&mut self.used);
        Ok(())
    }
}
