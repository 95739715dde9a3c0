//! Exclusive ownership of device-level Vulkan handles.
//!
//! Each [`Owned`] destroys its handle when dropped, so a constructor that
//! fails halfway releases whatever it already created. Composite objects
//! declare their `Owned` fields in reverse creation order so that field drop
//! order matches the destruction order Vulkan requires.

use ash::vk;

/// A device-level handle that knows how to destroy itself.
pub trait DeviceHandle: Copy {
    /// Release the handle.
    ///
    /// # Safety
    /// The handle must have been created from `device` and must not be in use.
    unsafe fn destroy(self, device: &ash::Device);
}

macro_rules! device_handle {
    ($($handle:ty => $destroy:ident),* $(,)?) => {
        $(
            impl DeviceHandle for $handle {
                unsafe fn destroy(self, device: &ash::Device) {
                    device.$destroy(self, None);
                }
            }
        )*
    };
}

device_handle! {
    vk::Buffer => destroy_buffer,
    vk::DeviceMemory => free_memory,
    vk::ShaderModule => destroy_shader_module,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::Pipeline => destroy_pipeline,
    vk::CommandPool => destroy_command_pool,
    vk::Fence => destroy_fence,
}

/// A handle exclusively owned for the lifetime of its device borrow.
pub struct Owned<'d, H: DeviceHandle> {
    device: &'d ash::Device,
    handle: H,
}

impl<'d, H: DeviceHandle> Owned<'d, H> {
    /// Take ownership of `handle`.
    ///
    /// # Safety
    /// `handle` must have been created from `device` and must not be owned elsewhere.
    pub unsafe fn new(device: &'d ash::Device, handle: H) -> Self {
        Self { device, handle }
    }

    /// The raw handle.
    pub fn raw(&self) -> H {
        self.handle
    }

    /// The device this handle belongs to.
    pub fn device(&self) -> &'d ash::Device {
        self.device
    }
}

impl<H: DeviceHandle> Drop for Owned<'_, H> {
    fn drop(&mut self) {
        unsafe { self.handle.destroy(self.device) };
    }
}

impl<H: DeviceHandle + std::fmt::Debug> std::fmt::Debug for Owned<'_, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).finish()
    }
}
