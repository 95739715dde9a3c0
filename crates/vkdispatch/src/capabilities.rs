//! Device diagnostic report.

use crate::version::Version;
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;
use std::fmt;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Compute-related device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeLimits {
    pub max_work_group_count: [u32; 3],
    pub max_work_group_size: [u32; 3],
    pub max_work_group_invocations: u32,
    pub max_shared_memory_size: u32,
}

impl From<&vk::PhysicalDeviceLimits> for ComputeLimits {
    fn from(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_work_group_count: limits.max_compute_work_group_count,
            max_work_group_size: limits.max_compute_work_group_size,
            max_work_group_invocations: limits.max_compute_work_group_invocations,
            max_shared_memory_size: limits.max_compute_shared_memory_size,
        }
    }
}

/// Vendor-specific shader core properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderCoreInfo {
    /// From `VK_AMD_shader_core_properties`.
    Amd {
        shader_engine_count: u32,
        shader_arrays_per_engine_count: u32,
        compute_units_per_shader_array: u32,
        simd_per_compute_unit: u32,
        wavefront_size: u32,
    },
    /// From `VK_NV_shader_sm_builtins`.
    Nvidia {
        shader_sm_count: u32,
        shader_warps_per_sm: u32,
    },
}

const AMD_SHADER_CORE: &str = "VK_AMD_shader_core_properties";
const NV_SM_BUILTINS: &str = "VK_NV_shader_sm_builtins";

/// Snapshot of the selected device, for humans.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: Version,
    pub driver_version: u32,
    pub loaded_version: Version,
    pub compute: ComputeLimits,
    /// `(size in bytes, flags)` per memory heap.
    pub memory_heaps: Vec<(u64, vk::MemoryHeapFlags)>,
    pub shader_core: Option<ShaderCoreInfo>,
}

impl DeviceReport {
    /// Query the report from a physical device.
    ///
    /// Vendor properties are only queried when the device advertises the
    /// extension and `properties2` is usable (instance created for 1.1+).
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        loaded_version: Version,
        instance_api: Version,
    ) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let memory_heaps = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .map(|heap| (heap.size, heap.flags))
            .collect();

        let api_version = Version::from_raw(properties.api_version);
        let properties2_usable = instance_api >= Version { major: 1, minor: 1, patch: 0 }
            && api_version >= Version { major: 1, minor: 1, patch: 0 };

        let shader_core = if properties2_usable {
            query_shader_core(instance, physical_device)
        } else {
            None
        };

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version,
            driver_version: properties.driver_version,
            loaded_version,
            compute: ComputeLimits::from(&properties.limits),
            memory_heaps,
            shader_core,
        }
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {} (loader {})",
            self.device_name, self.vendor, self.device_type, self.api_version, self.loaded_version,
        )
    }
}

unsafe fn query_shader_core(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<ShaderCoreInfo> {
    let extensions: HashSet<String> = instance
        .enumerate_device_extension_properties(physical_device)
        .unwrap_or_default()
        .iter()
        .filter_map(|ext| {
            CStr::from_ptr(ext.extension_name.as_ptr())
                .to_str()
                .ok()
                .map(String::from)
        })
        .collect();

    if extensions.contains(AMD_SHADER_CORE) {
        let mut core = vk::PhysicalDeviceShaderCorePropertiesAMD::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut core);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        return Some(ShaderCoreInfo::Amd {
            shader_engine_count: core.shader_engine_count,
            shader_arrays_per_engine_count: core.shader_arrays_per_engine_count,
            compute_units_per_shader_array: core.compute_units_per_shader_array,
            simd_per_compute_unit: core.simd_per_compute_unit,
            wavefront_size: core.wavefront_size,
        });
    }

    if extensions.contains(NV_SM_BUILTINS) {
        let mut sm = vk::PhysicalDeviceShaderSMBuiltinsPropertiesNV::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut sm);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        return Some(ShaderCoreInfo::Nvidia {
            shader_sm_count: sm.shader_sm_count,
            shader_warps_per_sm: sm.shader_warps_per_sm,
        });
    }

    None
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device Name: {}", self.device_name)?;
        writeln!(f, "Vendor: {:?}", self.vendor)?;
        writeln!(f, "Device Type: {:?}", self.device_type)?;
        writeln!(f, "Device Vulkan Version: {}", self.api_version)?;
        writeln!(f, "Loaded Vulkan Version: {}", self.loaded_version)?;
        writeln!(f, "Driver Version: {:#x}", self.driver_version)?;
        writeln!(
            f,
            "Max Compute Work Group Count: {:?}",
            self.compute.max_work_group_count
        )?;
        writeln!(
            f,
            "Max Compute Work Group Size: {:?}",
            self.compute.max_work_group_size
        )?;
        writeln!(
            f,
            "Max Compute Work Group Invocations: {}",
            self.compute.max_work_group_invocations
        )?;
        writeln!(
            f,
            "Max Compute Shared Memory Size: {} KB",
            self.compute.max_shared_memory_size / 1024
        )?;
        for (i, (size, flags)) in self.memory_heaps.iter().enumerate() {
            writeln!(f, "Memory Heap {i}: {} MB {flags:?}", size / (1024 * 1024))?;
        }
        match self.shader_core {
            Some(ShaderCoreInfo::Amd {
                shader_engine_count,
                shader_arrays_per_engine_count,
                compute_units_per_shader_array,
                simd_per_compute_unit,
                wavefront_size,
            }) => {
                writeln!(f, "Shader Engines: {shader_engine_count}")?;
                writeln!(f, "Shader Arrays Per Engine: {shader_arrays_per_engine_count}")?;
                writeln!(f, "Compute Units Per Array: {compute_units_per_shader_array}")?;
                writeln!(f, "SIMDs Per Compute Unit: {simd_per_compute_unit}")?;
                write!(f, "Wavefront Size: {wavefront_size}")
            }
            Some(ShaderCoreInfo::Nvidia {
                shader_sm_count,
                shader_warps_per_sm,
            }) => {
                writeln!(f, "Streaming Multiprocessors: {shader_sm_count}")?;
                write!(f, "Warps Per SM: {shader_warps_per_sm}")
            }
            None => write!(f, "Shader Core Properties: unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> DeviceReport {
        DeviceReport {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: Version::from_raw(vk::make_api_version(0, 1, 3, 250)),
            driver_version: 0x1234,
            loaded_version: Version::from_raw(vk::API_VERSION_1_3),
            compute: ComputeLimits {
                max_work_group_count: [65535, 65535, 65535],
                max_work_group_size: [1024, 1024, 64],
                max_work_group_invocations: 1024,
                max_shared_memory_size: 65536,
            },
            memory_heaps: vec![(8 * 1024 * 1024 * 1024, vk::MemoryHeapFlags::DEVICE_LOCAL)],
            shader_core: Some(ShaderCoreInfo::Amd {
                shader_engine_count: 4,
                shader_arrays_per_engine_count: 2,
                compute_units_per_shader_array: 10,
                simd_per_compute_unit: 2,
                wavefront_size: 32,
            }),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x5143), GpuVendor::Other(0x5143));
    }

    #[test]
    fn report_lists_limits_and_cores() {
        let text = sample_report().to_string();
        assert!(text.starts_with("Device Name: Test GPU"));
        assert!(text.contains("Device Vulkan Version: 1.3.250"));
        assert!(text.contains("Max Compute Shared Memory Size: 64 KB"));
        assert!(text.contains("Memory Heap 0: 8192 MB"));
        assert!(text.contains("Wavefront Size: 32"));
    }

    #[test]
    fn summary_is_single_line() {
        let summary = sample_report().summary();
        assert!(!summary.contains('\n'));
        assert!(summary.contains("Test GPU"));
    }
}
