//! GPU context management.

use crate::budget::MemoryBudget;
use crate::capabilities::DeviceReport;
use crate::error::{ComputeError, Result};
use crate::instance::{create_instance, select_physical_device, VALIDATION_LAYER};
use crate::version::{Version, VersionInfo};
use ash::vk;
use std::ffi::{CStr, CString};
use std::ops::Deref;

/// Configuration for creating a [`Context`].
#[derive(Debug, Clone)]
pub struct AppInfo {
    /// Target Vulkan API version (`vk::make_api_version` encoding).
    pub api_version: u32,
    /// Instance layers to enable.
    pub layers: Vec<CString>,
    /// Instance extensions to enable.
    pub extensions: Vec<CString>,
    /// Number of queues created on the selected family.
    pub queue_count: u32,
    /// Priority assigned to every created queue.
    pub queue_priority: f32,
    /// Capability the selected queue family must expose.
    pub queue_flags: vk::QueueFlags,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            api_version: vk::API_VERSION_1_1,
            layers: Vec::new(),
            extensions: Vec::new(),
            queue_count: 1,
            queue_priority: 1.0,
            queue_flags: vk::QueueFlags::COMPUTE,
        }
    }
}

impl AppInfo {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target API version.
    pub fn api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    /// Request an instance layer.
    pub fn layer(mut self, name: &CStr) -> Self {
        self.layers.push(name.to_owned());
        self
    }

    /// Request an instance extension.
    pub fn extension(mut self, name: &CStr) -> Self {
        self.extensions.push(name.to_owned());
        self
    }

    /// Enable or disable the Khronos validation layer.
    pub fn validation(mut self, enable: bool) -> Self {
        self.layers.retain(|l| l.as_c_str() != VALIDATION_LAYER);
        if enable {
            self.layers.push(VALIDATION_LAYER.to_owned());
        }
        self
    }

    /// Set how many queues to create.
    pub fn queue_count(mut self, count: u32) -> Self {
        self.queue_count = count;
        self
    }

    /// Set the queue priority.
    pub fn queue_priority(mut self, priority: f32) -> Self {
        self.queue_priority = priority;
        self
    }

    /// Set the queue capability to look for.
    pub fn queue_flags(mut self, flags: vk::QueueFlags) -> Self {
        self.queue_flags = flags;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.queue_count == 0 {
            return Err(ComputeError::Config("queue_count must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.queue_priority) {
            return Err(ComputeError::Config(format!(
                "queue_priority {} outside [0, 1]",
                self.queue_priority
            )));
        }
        Ok(())
    }
}

/// Index of the first queue family whose flags contain `flags`.
pub fn index_of_first_queue_family(
    families: &[vk::QueueFamilyProperties],
    flags: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .position(|family| family.queue_flags.contains(flags))
        .map(|i| i as u32)
}

struct OwnedInstance(ash::Instance);

impl Deref for OwnedInstance {
    type Target = ash::Instance;

    fn deref(&self) -> &ash::Instance {
        &self.0
    }
}

impl Drop for OwnedInstance {
    fn drop(&mut self) {
        unsafe { self.0.destroy_instance(None) };
    }
}

struct OwnedDevice(ash::Device);

impl Deref for OwnedDevice {
    type Target = ash::Device;

    fn deref(&self) -> &ash::Device {
        &self.0
    }
}

impl Drop for OwnedDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.0.device_wait_idle();
            self.0.destroy_device(None);
        }
    }
}

/// Root object: entry point, instance, selected device and its compute queue family.
///
/// Every other object borrows the context and cannot outlive it.
pub struct Context {
    budget: MemoryBudget,
    report: DeviceReport,
    version_info: VersionInfo,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_family_index: u32,
    physical_device: vk::PhysicalDevice,
    // Field order is drop order: device before instance before entry.
    device: OwnedDevice,
    instance: OwnedInstance,
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
}

impl Context {
    /// Build a context from `info`.
    pub fn new(info: &AppInfo) -> Result<Self> {
        info.validate()?;

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| ComputeError::InstanceCreation(format!("Failed to load Vulkan: {e}")))?;

        // Gate on the loader version before any instance exists.
        let loaded = unsafe { entry.try_enumerate_instance_version() }?
            .unwrap_or(vk::API_VERSION_1_0);
        let version_info = VersionInfo::new(loaded, info.api_version)?;

        let instance = OwnedInstance(unsafe {
            create_instance(&entry, info.api_version, &info.layers, &info.extensions)
        }?);

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family_index = index_of_first_queue_family(&families, info.queue_flags)
            .ok_or(ComputeError::NoQueueFamily(info.queue_flags))?;

        let available = families[queue_family_index as usize].queue_count;
        if info.queue_count > available {
            return Err(ComputeError::Config(format!(
                "queue family {queue_family_index} has {available} queues, {} requested",
                info.queue_count
            )));
        }

        let device = OwnedDevice(unsafe {
            create_device(
                &instance,
                physical_device,
                queue_family_index,
                info.queue_count,
                info.queue_priority,
            )
        }?);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let report = unsafe {
            DeviceReport::query(
                &instance,
                physical_device,
                version_info.loaded,
                Version::from_raw(info.api_version),
            )
        };
        tracing::info!("Selected GPU: {}", report.summary());
        tracing::debug!("Device report:\n{report}");
        tracing::debug!(
            "Compute queue family {} ({} queue(s), priority {})",
            queue_family_index,
            info.queue_count,
            info.queue_priority
        );

        Ok(Self {
            budget: MemoryBudget::new(),
            report,
            version_info,
            properties,
            memory_properties,
            queue_family_index,
            physical_device,
            device,
            instance,
            entry,
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the selected queue family index.
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Physical-device properties captured at construction.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Memory properties captured at construction.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Result of the API version check.
    pub fn version_info(&self) -> &VersionInfo {
        &self.version_info
    }

    /// Allocation tracking shared by all buffers of this context.
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Diagnostic snapshot of the device.
    pub fn report(&self) -> &DeviceReport {
        &self.report
    }

    /// Human-readable device dump.
    pub fn print_debug_info(&self) -> String {
        self.report.to_string()
    }

    /// Queue `index` of the selected family.
    pub fn queue(&self, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(self.queue_family_index, index) }
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

/// Create the logical device with `queue_count` queues on one family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    queue_count: u32,
    queue_priority: f32,
) -> Result<ash::Device> {
    let priorities = vec![queue_priority; queue_count as usize];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&priorities);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info));

    instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(ComputeError::DeviceCreation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn first_compute_family_is_selected() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(
            index_of_first_queue_family(&families, vk::QueueFlags::COMPUTE),
            Some(1)
        );
        assert_eq!(
            index_of_first_queue_family(&families, vk::QueueFlags::TRANSFER),
            Some(0)
        );
    }

    #[test]
    fn missing_capability_yields_none() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::SPARSE_BINDING),
        ];
        assert_eq!(
            index_of_first_queue_family(&families, vk::QueueFlags::COMPUTE),
            None
        );
        assert_eq!(index_of_first_queue_family(&[], vk::QueueFlags::COMPUTE), None);
    }

    #[test]
    fn combined_flags_require_all_bits() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(
            index_of_first_queue_family(
                &families,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE
            ),
            Some(1)
        );
    }

    #[test]
    fn app_info_builder() {
        let info = AppInfo::new()
            .api_version(vk::API_VERSION_1_2)
            .validation(true)
            .validation(true)
            .extension(c"VK_EXT_debug_utils")
            .queue_count(2)
            .queue_priority(0.5);

        assert_eq!(info.api_version, vk::API_VERSION_1_2);
        assert_eq!(info.layers, vec![VALIDATION_LAYER.to_owned()]);
        assert_eq!(info.extensions.len(), 1);
        assert_eq!(info.queue_count, 2);
        assert!(info.validate().is_ok());
        assert!(AppInfo::new().validation(true).validation(false).layers.is_empty());
    }

    #[test]
    fn invalid_queue_settings_are_rejected() {
        assert!(matches!(
            AppInfo::new().queue_count(0).validate(),
            Err(ComputeError::Config(_))
        ));
        assert!(matches!(
            AppInfo::new().queue_priority(1.5).validate(),
            Err(ComputeError::Config(_))
        ));
    }
}
