//! Compute pipeline bound to a fixed set of buffers.

use crate::context::Context;
use crate::descriptors::{
    buffer_infos, buffer_writes, create_pool, pool_size, DescriptorResource,
    DescriptorSetLayoutBuilder,
};
use crate::error::{ComputeError, Result};
use crate::handle::Owned;
use crate::shader::load_spirv;
use ash::vk;
use std::ffi::CString;
use std::marker::PhantomData;
use std::path::Path;

/// A compute pipeline with its descriptor set already written.
///
/// Owns the shader module, descriptor set layout, descriptor pool, pipeline
/// layout and pipeline. The single descriptor set is freed with the pool.
/// Buffers are borrowed, not owned, and must outlive the pipeline.
pub struct Pipeline<'a> {
    // Field order is drop order, the reverse of creation.
    pipeline: Owned<'a, vk::Pipeline>,
    layout: Owned<'a, vk::PipelineLayout>,
    pool: Owned<'a, vk::DescriptorPool>,
    set_layout: Owned<'a, vk::DescriptorSetLayout>,
    shader_module: Owned<'a, vk::ShaderModule>,
    descriptor_set: vk::DescriptorSet,
    binding_count: usize,
    _buffers: PhantomData<&'a ()>,
}

impl<'a> Pipeline<'a> {
    /// Build a pipeline from a SPIR-V file.
    pub fn new<R: DescriptorResource>(
        context: &'a Context,
        shader_path: impl AsRef<Path>,
        entry_name: &str,
        buffers: &'a [R],
    ) -> Result<Self> {
        let code = load_spirv(shader_path)?;
        Self::from_spirv(context, &code, entry_name, buffers)
    }

    /// Build a pipeline from SPIR-V words already in memory.
    pub fn from_spirv<R: DescriptorResource>(
        context: &'a Context,
        code: &[u32],
        entry_name: &str,
        buffers: &'a [R],
    ) -> Result<Self> {
        let entry_name = CString::new(entry_name)
            .map_err(|e| ComputeError::pipeline("compute pipeline", e))?;
        let layout_builder = DescriptorSetLayoutBuilder::from_resources(buffers)?;
        let pool_size = pool_size(buffers)?;

        let device = context.device();

        let shader_module = unsafe {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            let raw = device
                .create_shader_module(&info, None)
                .map_err(|e| ComputeError::pipeline("shader module", e))?;
            Owned::new(device, raw)
        };

        let set_layout = unsafe { Owned::new(device, layout_builder.build(device)?) };

        let pool = unsafe { Owned::new(device, create_pool(device, pool_size)?) };

        let layout = unsafe {
            let set_layouts = [set_layout.raw()];
            let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
            let raw = device
                .create_pipeline_layout(&info, None)
                .map_err(|e| ComputeError::pipeline("pipeline layout", e))?;
            Owned::new(device, raw)
        };

        let pipeline = unsafe {
            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(shader_module.raw())
                .name(&entry_name);
            let info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(layout.raw());
            let pipelines = device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_pipelines, e)| ComputeError::pipeline("compute pipeline", e))?;
            Owned::new(device, pipelines[0])
        };

        let descriptor_set = unsafe {
            let set_layouts = [set_layout.raw()];
            let info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool.raw())
                .set_layouts(&set_layouts);
            device
                .allocate_descriptor_sets(&info)
                .map_err(|e| ComputeError::pipeline("descriptor set", e))?[0]
        };

        let infos = buffer_infos(buffers);
        let writes = buffer_writes(descriptor_set, buffers, &infos);
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        tracing::info!(
            "Constructed pipeline '{}' with {} buffers",
            entry_name.to_string_lossy(),
            buffers.len()
        );

        Ok(Self {
            pipeline,
            layout,
            pool,
            set_layout,
            shader_module,
            descriptor_set,
            binding_count: buffers.len(),
            _buffers: PhantomData,
        })
    }

    /// Raw pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    /// Pipeline layout.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }

    /// The descriptor set holding every buffer.
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Layout of the descriptor set.
    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout.raw()
    }

    /// Pool the descriptor set was allocated from.
    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.pool.raw()
    }

    /// Compiled shader module.
    pub fn shader_module(&self) -> vk::ShaderModule {
        self.shader_module.raw()
    }

    /// Number of buffers written into the descriptor set.
    pub fn binding_count(&self) -> usize {
        self.binding_count
    }
}
