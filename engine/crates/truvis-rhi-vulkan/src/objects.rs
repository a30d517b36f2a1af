//! RHI 资源对应的 Vulkan 对象

use std::ffi::CString;
use std::io::Cursor;

use ash::vk;
use itertools::Itertools;
use truvis_rhi::backend::{MemoryBinding, ResolvedDescriptor};
use truvis_rhi::resource::desc::{
    BufferDesc, DescriptorSetLayout, DescriptorType, ImageDesc, PipelineDesc, PipelineKind, SamplerDesc, ShaderDesc,
};
use truvis_rhi::{RhiError, RhiResult};

use crate::backend::VulkanShared;
use crate::convert::{self, vk_error};

pub(crate) enum VulkanObject {
    Buffer {
        buffer: vk::Buffer,
    },
    Image {
        image: vk::Image,
        view: vk::ImageView,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent3D,
        array_layers: u32,
        mip_levels: u32,
        /// swapchain 的 image 由 swapchain 持有，只销毁 view
        owned: bool,
    },
    Sampler(vk::Sampler),
    Pipeline {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        set_layouts: Vec<vk::DescriptorSetLayout>,
        bind_point: vk::PipelineBindPoint,
    },
    DescriptorSet {
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        set: vk::DescriptorSet,
    },
}

impl VulkanObject {
    pub(crate) fn subresource_range(aspect: vk::ImageAspectFlags, mip_levels: u32, layers: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(aspect)
            .base_mip_level(0)
            .level_count(mip_levels)
            .base_array_layer(0)
            .layer_count(layers)
    }
}

/// 所有 binding 的 stage 都是 ALL，这样 pipeline 的 set layout 和按 binding 创建的 set layout 兼容
fn create_set_layout(
    device: &ash::Device,
    bindings: impl IntoIterator<Item = (u32, DescriptorType)>,
) -> RhiResult<vk::DescriptorSetLayout> {
    let bindings = bindings
        .into_iter()
        .map(|(binding, ty)| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(convert::descriptor_type(ty))
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL)
        })
        .collect_vec();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None) }.map_err(|e| vk_error("create set layout", e))
}

// 创建
impl VulkanShared {
    /// 多个 queue family 时使用 CONCURRENT，跨 queue 使用时不需要 ownership transfer
    fn sharing<'a>(&self, families: &'a [u32]) -> (vk::SharingMode, &'a [u32]) {
        if families.len() > 1 { (vk::SharingMode::CONCURRENT, families) } else { (vk::SharingMode::EXCLUSIVE, &[]) }
    }

    fn check_memory_type(&self, requirements: vk::MemoryRequirements, binding: &MemoryBinding) -> RhiResult<vk::DeviceMemory> {
        let memory = self.memory.lock();
        let allocation = memory
            .get(binding.memory)
            .ok_or_else(|| RhiError::Backend(format!("unknown memory {:?}", binding.memory)))?;
        let type_index = memory.type_index(allocation.locality);
        if requirements.memory_type_bits & (1 << type_index) == 0 {
            return Err(RhiError::Backend(format!(
                "memory type {} is not allowed by the resource (bits {:#b})",
                type_index, requirements.memory_type_bits
            )));
        }
        Ok(allocation.memory)
    }

    pub(crate) fn buffer_create_info<'a>(&self, desc: &BufferDesc, families: &'a [u32]) -> vk::BufferCreateInfo<'a> {
        let (sharing_mode, families) = self.sharing(families);
        vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
    }

    pub(crate) fn image_create_info<'a>(&self, desc: &ImageDesc, families: &'a [u32]) -> vk::ImageCreateInfo<'a> {
        let (sharing_mode, families) = self.sharing(families);
        vk::ImageCreateInfo::default()
            .image_type(convert::image_type(desc.dimension))
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: desc.extent.depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(convert::sample_count(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(desc.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }

    pub(crate) fn create_buffer(&self, desc: &BufferDesc, binding: &MemoryBinding) -> RhiResult<VulkanObject> {
        let device = &self.device.device;
        let families = self.family_indices();
        let create_info = self.buffer_create_info(desc, &families);
        let buffer = unsafe { device.create_buffer(&create_info, None) }.map_err(|e| vk_error("create buffer", e))?;

        let bound = self
            .check_memory_type(unsafe { device.get_buffer_memory_requirements(buffer) }, binding)
            .and_then(|memory| {
                unsafe { device.bind_buffer_memory(buffer, memory, binding.offset) }
                    .map_err(|e| vk_error("bind buffer memory", e))
            });
        if let Err(e) = bound {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e);
        }
        self.device.set_object_debug_name(buffer, &desc.label);
        Ok(VulkanObject::Buffer { buffer })
    }

    pub(crate) fn create_image(&self, desc: &ImageDesc, binding: &MemoryBinding) -> RhiResult<VulkanObject> {
        let device = &self.device.device;
        let families = self.family_indices();
        let create_info = self.image_create_info(desc, &families);
        let image = unsafe { device.create_image(&create_info, None) }.map_err(|e| vk_error("create image", e))?;

        let bound = self
            .check_memory_type(unsafe { device.get_image_memory_requirements(image) }, binding)
            .and_then(|memory| {
                unsafe { device.bind_image_memory(image, memory, binding.offset) }
                    .map_err(|e| vk_error("bind image memory", e))
            });
        if let Err(e) = bound {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
        self.device.set_object_debug_name(image, &desc.label);

        match self.wrap_image(image, desc, true) {
            Ok(object) => Ok(object),
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    /// 为 image 创建覆盖所有 mip 和 layer 的 view
    pub(crate) fn wrap_image(&self, image: vk::Image, desc: &ImageDesc, owned: bool) -> RhiResult<VulkanObject> {
        let aspect = convert::aspect(desc.format);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(convert::image_view_type(desc.dimension, desc.array_layers))
            .format(convert::format(desc.format))
            .subresource_range(VulkanObject::subresource_range(aspect, desc.mip_levels, desc.array_layers));
        let view = unsafe { self.device.device.create_image_view(&view_info, None) }
            .map_err(|e| vk_error("create image view", e))?;
        self.device.set_object_debug_name(view, &format!("{}-view", desc.label));

        Ok(VulkanObject::Image {
            image,
            view,
            aspect,
            extent: vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: desc.extent.depth,
            },
            array_layers: desc.array_layers,
            mip_levels: desc.mip_levels,
            owned,
        })
    }

    pub(crate) fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<VulkanObject> {
        let address_mode = convert::address_mode(desc.address_mode);
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert::filter(desc.mag_filter))
            .min_filter(convert::filter(desc.min_filter))
            .mipmap_mode(convert::mipmap_mode(desc.mipmap_filter))
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.device.device.create_sampler(&create_info, None) }
            .map_err(|e| vk_error("create sampler", e))?;
        self.device.set_object_debug_name(sampler, &desc.label);
        Ok(VulkanObject::Sampler(sampler))
    }

    fn create_shader_module(&self, shader: &ShaderDesc) -> RhiResult<vk::ShaderModule> {
        let words = ash::util::read_spv(&mut Cursor::new(&shader.code))
            .map_err(|e| RhiError::InvalidDescriptor(format!("invalid spir-v: {e}")))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        unsafe { self.device.device.create_shader_module(&create_info, None) }
            .map_err(|e| vk_error("create shader module", e))
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayout],
        push_constant_size: u32,
    ) -> RhiResult<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>)> {
        let device = &self.device.device;
        let mut vk_set_layouts = Vec::with_capacity(set_layouts.len());
        for layout in set_layouts {
            match create_set_layout(device, layout.bindings.iter().map(|b| (b.binding, b.ty))) {
                Ok(set_layout) => vk_set_layouts.push(set_layout),
                Err(e) => {
                    self.destroy_set_layouts(&vk_set_layouts);
                    return Err(e);
                }
            }
        }

        let push_constant_ranges = if push_constant_size > 0 {
            vec![vk::PushConstantRange::default().stage_flags(vk::ShaderStageFlags::ALL).offset(0).size(push_constant_size)]
        } else {
            Vec::new()
        };
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&vk_set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        match unsafe { device.create_pipeline_layout(&create_info, None) } {
            Ok(layout) => Ok((layout, vk_set_layouts)),
            Err(e) => {
                self.destroy_set_layouts(&vk_set_layouts);
                Err(vk_error("create pipeline layout", e))
            }
        }
    }

    pub(crate) fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<VulkanObject> {
        let _span = truvis_rhi::rhi_span!("VulkanShared::create_pipeline");
        let device = &self.device.device;
        let (layout, set_layouts) = self.create_pipeline_layout(&desc.set_layouts, desc.push_constant_size)?;

        let mut modules = Vec::new();
        let created = match &desc.kind {
            PipelineKind::Compute { shader } => self.create_shader_module(shader).and_then(|module| {
                modules.push(module);
                let entry = CString::new(shader.entry_point.as_str())
                    .map_err(|_| RhiError::InvalidDescriptor("entry point contains a nul byte".into()))?;
                let stage = vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::COMPUTE)
                    .module(module)
                    .name(&entry);
                let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
                unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None) }
                    .map_err(|(_, e)| vk_error("create compute pipeline", e))
                    .map(|pipelines| (pipelines[0], vk::PipelineBindPoint::COMPUTE))
            }),
            PipelineKind::Graphics { .. } => self
                .create_graphics_pipeline(desc, layout, &mut modules)
                .map(|pipeline| (pipeline, vk::PipelineBindPoint::GRAPHICS)),
        };

        for module in modules {
            unsafe { device.destroy_shader_module(module, None) };
        }
        match created {
            Ok((pipeline, bind_point)) => {
                self.device.set_object_debug_name(pipeline, &desc.label);
                Ok(VulkanObject::Pipeline {
                    pipeline,
                    layout,
                    set_layouts,
                    bind_point,
                })
            }
            Err(e) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                self.destroy_set_layouts(&set_layouts);
                Err(e)
            }
        }
    }

    fn create_graphics_pipeline(
        &self,
        desc: &PipelineDesc,
        layout: vk::PipelineLayout,
        modules: &mut Vec<vk::ShaderModule>,
    ) -> RhiResult<vk::Pipeline> {
        let PipelineKind::Graphics {
            vertex,
            fragment,
            vertex_layouts,
            topology,
            color_formats,
            depth_format,
        } = &desc.kind
        else {
            return Err(RhiError::InvalidDescriptor(format!("{} is not a graphics pipeline", desc.label)));
        };

        let shaders: Vec<&ShaderDesc> = std::iter::once(vertex).chain(fragment.as_ref()).collect();
        let mut entries = Vec::with_capacity(shaders.len());
        for shader in &shaders {
            modules.push(self.create_shader_module(shader)?);
            entries.push(
                CString::new(shader.entry_point.as_str())
                    .map_err(|_| RhiError::InvalidDescriptor("entry point contains a nul byte".into()))?,
            );
        }
        let stages = shaders
            .iter()
            .zip(modules.iter())
            .zip(entries.iter())
            .map(|((shader, &module), entry)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(convert::shader_stage(shader.stage))
                    .module(module)
                    .name(entry)
            })
            .collect_vec();

        let vertex_bindings = vertex_layouts
            .iter()
            .enumerate()
            .map(|(i, layout)| {
                vk::VertexInputBindingDescription::default()
                    .binding(i as u32)
                    .stride(layout.stride)
                    .input_rate(vk::VertexInputRate::VERTEX)
            })
            .collect_vec();
        let vertex_attributes = vertex_layouts
            .iter()
            .enumerate()
            .flat_map(|(i, layout)| {
                layout.attributes.iter().map(move |attr| {
                    vk::VertexInputAttributeDescription::default()
                        .binding(i as u32)
                        .location(attr.location)
                        .format(convert::format(attr.format))
                        .offset(attr.offset)
                })
            })
            .collect_vec();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(convert::topology(*topology));

        // viewport 和 scissor 在 begin rendering 时设置
        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_format.is_some())
            .depth_write_enable(depth_format.is_some())
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachments = color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect_vec();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let vk_color_formats = color_formats.iter().map(|&f| convert::format(f)).collect_vec();
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&vk_color_formats);
        if let Some(depth) = depth_format {
            rendering_info = rendering_info.depth_attachment_format(convert::format(*depth));
            if depth.has_stencil() {
                rendering_info = rendering_info.stencil_attachment_format(convert::format(*depth));
            }
        }

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines =
            unsafe { self.device.device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) }
                .map_err(|(_, e)| vk_error("create graphics pipeline", e))?;
        Ok(pipelines[0])
    }

    /// 每个 set 使用独立的 pool，随 set 一起销毁
    pub(crate) fn create_descriptor_set(&self, descriptors: &[ResolvedDescriptor]) -> RhiResult<VulkanObject> {
        let device = &self.device.device;
        let layout = create_set_layout(device, descriptors.iter().map(|d| (d.binding, d.ty)))?;

        let pool_sizes = descriptors
            .iter()
            .counts_by(|d| d.ty)
            .into_iter()
            .map(|(ty, count)| {
                vk::DescriptorPoolSize::default()
                    .ty(convert::descriptor_type(ty))
                    .descriptor_count(count as u32)
            })
            .collect_vec();
        let pool_info = vk::DescriptorPoolCreateInfo::default().max_sets(1).pool_sizes(&pool_sizes);
        let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(vk_error("create descriptor pool", e));
            }
        };

        let set_layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&set_layouts);
        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(vk_error("allocate descriptor set", e));
            }
        };

        if let Err(e) = self.write_descriptors(set, descriptors) {
            unsafe {
                device.destroy_descriptor_pool(pool, None);
                device.destroy_descriptor_set_layout(layout, None);
            }
            return Err(e);
        }
        Ok(VulkanObject::DescriptorSet { pool, layout, set })
    }

    fn write_descriptors(&self, set: vk::DescriptorSet, descriptors: &[ResolvedDescriptor]) -> RhiResult<()> {
        let objects = self.objects.read();
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for descriptor in descriptors {
            let object = objects
                .get(&descriptor.object)
                .ok_or_else(|| RhiError::Backend(format!("unknown object {:?}", descriptor.object)))?;
            match (descriptor.ty, object) {
                (DescriptorType::UniformBuffer | DescriptorType::StorageBuffer, VulkanObject::Buffer { buffer }) => {
                    buffer_infos.push((
                        descriptor,
                        vk::DescriptorBufferInfo::default().buffer(*buffer).offset(0).range(vk::WHOLE_SIZE),
                    ));
                }
                (DescriptorType::SampledImage, VulkanObject::Image { view, .. }) => {
                    let sampler = match descriptor.sampler.and_then(|s| objects.get(&s)) {
                        Some(VulkanObject::Sampler(sampler)) => *sampler,
                        _ => return Err(RhiError::Backend("sampled image without a sampler".into())),
                    };
                    image_infos.push((
                        descriptor,
                        vk::DescriptorImageInfo::default()
                            .sampler(sampler)
                            .image_view(*view)
                            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                    ));
                }
                (DescriptorType::StorageImage, VulkanObject::Image { view, .. }) => {
                    image_infos.push((
                        descriptor,
                        vk::DescriptorImageInfo::default().image_view(*view).image_layout(vk::ImageLayout::GENERAL),
                    ));
                }
                (ty, _) => {
                    return Err(RhiError::Backend(format!(
                        "binding {} of type {:?} points to a wrong object",
                        descriptor.binding, ty
                    )));
                }
            }
        }

        let writes = buffer_infos
            .iter()
            .map(|(d, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(d.binding)
                    .descriptor_type(convert::descriptor_type(d.ty))
                    .buffer_info(std::slice::from_ref(info))
            })
            .chain(image_infos.iter().map(|(d, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(d.binding)
                    .descriptor_type(convert::descriptor_type(d.ty))
                    .image_info(std::slice::from_ref(info))
            }))
            .collect_vec();
        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}
// destroy
impl VulkanShared {
    fn destroy_set_layouts(&self, layouts: &[vk::DescriptorSetLayout]) {
        for &layout in layouts {
            unsafe { self.device.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    pub(crate) fn destroy_vulkan_object(&self, object: VulkanObject) {
        let device = &self.device.device;
        unsafe {
            match object {
                VulkanObject::Buffer { buffer } => device.destroy_buffer(buffer, None),
                VulkanObject::Image { image, view, owned, .. } => {
                    device.destroy_image_view(view, None);
                    if owned {
                        device.destroy_image(image, None);
                    }
                }
                VulkanObject::Sampler(sampler) => device.destroy_sampler(sampler, None),
                VulkanObject::Pipeline {
                    pipeline,
                    layout,
                    set_layouts,
                    ..
                } => {
                    device.destroy_pipeline(pipeline, None);
                    device.destroy_pipeline_layout(layout, None);
                    self.destroy_set_layouts(&set_layouts);
                }
                VulkanObject::DescriptorSet { pool, layout, .. } => {
                    // set 随 pool 一起释放
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
            }
        }
    }
}
