//! Descriptor layout, pool and write derivation.

use crate::error::{ComputeError, Result};
use ash::vk;
use std::collections::HashSet;

/// Anything a compute pipeline can bind as a buffer descriptor.
pub trait DescriptorResource {
    /// Binding slot in the shader's descriptor set.
    fn binding(&self) -> u32;
    /// Descriptor kind.
    fn descriptor_type(&self) -> vk::DescriptorType;
    /// Buffer handle to bind.
    fn buffer(&self) -> vk::Buffer;
    /// Bytes visible to the shader, starting at offset 0.
    fn byte_size(&self) -> vk::DeviceSize;
}

impl<T: DescriptorResource + ?Sized> DescriptorResource for &T {
    fn binding(&self) -> u32 {
        (**self).binding()
    }

    fn descriptor_type(&self) -> vk::DescriptorType {
        (**self).descriptor_type()
    }

    fn buffer(&self) -> vk::Buffer {
        (**self).buffer()
    }

    fn byte_size(&self) -> vk::DeviceSize {
        (**self).byte_size()
    }
}

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// One compute-stage binding per resource, in input order.
    ///
    /// Fails if `resources` is empty or two resources share a binding slot.
    pub fn from_resources<R: DescriptorResource>(resources: &[R]) -> Result<Self> {
        if resources.is_empty() {
            return Err(ComputeError::pipeline(
                "descriptor set layout",
                "no buffers supplied",
            ));
        }

        let mut seen = HashSet::with_capacity(resources.len());
        let mut builder = Self::new();
        for resource in resources {
            if !seen.insert(resource.binding()) {
                return Err(ComputeError::pipeline(
                    "descriptor set layout",
                    format!("binding {} used more than once", resource.binding()),
                ));
            }
            builder = builder.binding(resource.binding(), resource.descriptor_type());
        }
        Ok(builder)
    }

    /// Add a single-descriptor compute binding.
    pub fn binding(mut self, binding: u32, descriptor_type: vk::DescriptorType) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        );
        self
    }

    /// The bindings collected so far.
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        device
            .create_descriptor_set_layout(&layout_info, None)
            .map_err(|e| ComputeError::pipeline("descriptor set layout", e))
    }
}

impl Default for DescriptorSetLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool size for one set holding every resource.
///
/// The pool is sized entirely by the first resource's kind. Sets mixing
/// kinds are accepted but logged, since the pool may then be too small on
/// strict drivers.
pub fn pool_size<R: DescriptorResource>(resources: &[R]) -> Result<vk::DescriptorPoolSize> {
    let first = resources
        .first()
        .ok_or_else(|| ComputeError::pipeline("descriptor pool", "no buffers supplied"))?;
    let ty = first.descriptor_type();

    if resources.iter().any(|r| r.descriptor_type() != ty) {
        tracing::warn!(
            "Descriptor pool sized for {:?} only, but bindings use mixed descriptor kinds",
            ty
        );
    }

    Ok(vk::DescriptorPoolSize::default()
        .ty(ty)
        .descriptor_count(resources.len() as u32))
}

/// Create a pool for exactly one descriptor set.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_pool(
    device: &ash::Device,
    pool_size: vk::DescriptorPoolSize,
) -> Result<vk::DescriptorPool> {
    let pool_sizes = [pool_size];
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&pool_sizes)
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

    device
        .create_descriptor_pool(&create_info, None)
        .map_err(|e| ComputeError::pipeline("descriptor pool", e))
}

/// Full-range buffer infos, one per resource, in input order.
pub fn buffer_infos<R: DescriptorResource>(resources: &[R]) -> Vec<vk::DescriptorBufferInfo> {
    resources
        .iter()
        .map(|resource| {
            vk::DescriptorBufferInfo::default()
                .buffer(resource.buffer())
                .offset(0)
                .range(resource.byte_size())
        })
        .collect()
}

/// One write per resource into `dst_set`, pointing at the matching entry of `infos`.
pub fn buffer_writes<'a, R: DescriptorResource>(
    dst_set: vk::DescriptorSet,
    resources: &[R],
    infos: &'a [vk::DescriptorBufferInfo],
) -> Vec<vk::WriteDescriptorSet<'a>> {
    resources
        .iter()
        .zip(infos)
        .map(|(resource, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(dst_set)
                .dst_binding(resource.binding())
                .dst_array_element(0)
                .descriptor_type(resource.descriptor_type())
                .buffer_info(std::slice::from_ref(info))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    struct FakeBuffer {
        binding: u32,
        ty: vk::DescriptorType,
        handle: vk::Buffer,
        size: u64,
    }

    impl DescriptorResource for FakeBuffer {
        fn binding(&self) -> u32 {
            self.binding
        }

        fn descriptor_type(&self) -> vk::DescriptorType {
            self.ty
        }

        fn buffer(&self) -> vk::Buffer {
            self.handle
        }

        fn byte_size(&self) -> vk::DeviceSize {
            self.size
        }
    }

    fn storage(binding: u32, raw: u64, size: u64) -> FakeBuffer {
        FakeBuffer {
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            handle: vk::Buffer::from_raw(raw),
            size,
        }
    }

    #[test]
    fn layout_follows_input_order() {
        let buffers = [storage(3, 0x30, 16), storage(0, 0x10, 2052), storage(7, 0x70, 4)];
        let builder = DescriptorSetLayoutBuilder::from_resources(&buffers).unwrap();

        let slots: Vec<u32> = builder.bindings().iter().map(|b| b.binding).collect();
        assert_eq!(slots, vec![3, 0, 7]);
        for binding in builder.bindings() {
            assert_eq!(binding.descriptor_count, 1);
            assert_eq!(binding.stage_flags, vk::ShaderStageFlags::COMPUTE);
            assert_eq!(binding.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        }
    }

    #[test]
    fn writes_reference_buffer_at_same_position() {
        let buffers = [storage(3, 0x30, 16), storage(0, 0x10, 2052), storage(7, 0x70, 4)];
        let infos = buffer_infos(&buffers);
        let set = vk::DescriptorSet::from_raw(0x99);
        let writes = buffer_writes(set, &buffers, &infos);

        assert_eq!(writes.len(), 3);
        for ((write, info), buffer) in writes.iter().zip(&infos).zip(&buffers) {
            assert_eq!(write.dst_set, set);
            assert_eq!(write.dst_binding, buffer.binding);
            assert_eq!(write.descriptor_count, 1);
            assert_eq!(write.p_buffer_info, info as *const _);
            assert_eq!(info.buffer, buffer.handle);
            assert_eq!(info.offset, 0);
            assert_eq!(info.range, buffer.size);
        }
    }

    #[test]
    fn references_work_as_resources() {
        let a = storage(0, 1, 8);
        let b = storage(1, 2, 8);
        let refs = [&a, &b];
        let builder = DescriptorSetLayoutBuilder::from_resources(&refs).unwrap();
        assert_eq!(builder.bindings().len(), 2);
    }

    #[test]
    fn duplicate_bindings_are_rejected() {
        let buffers = [storage(1, 1, 8), storage(1, 2, 8)];
        assert!(matches!(
            DescriptorSetLayoutBuilder::from_resources(&buffers),
            Err(ComputeError::PipelineCreation { .. })
        ));
    }

    #[test]
    fn empty_set_is_rejected() {
        let buffers: [FakeBuffer; 0] = [];
        assert!(DescriptorSetLayoutBuilder::from_resources(&buffers).is_err());
        assert!(pool_size(&buffers).is_err());
    }

    #[test]
    fn pool_is_sized_by_first_kind() {
        let mut mixed = [storage(0, 1, 8), storage(1, 2, 8), storage(2, 3, 8)];
        mixed[0].ty = vk::DescriptorType::UNIFORM_BUFFER;

        let size = pool_size(&mixed).unwrap();
        assert_eq!(size.ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(size.descriptor_count, 3);
    }
}
