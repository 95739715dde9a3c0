//! Vulkan instance creation and physical-device selection.

use crate::error::{ComputeError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Application name reported to the driver.
pub const APPLICATION_NAME: &CStr = c"compute";
/// Engine name reported to the driver.
pub const ENGINE_NAME: &CStr = c"engine";

/// Khronos validation layer.
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan instance.
///
/// Layers the loader does not know about are logged but still requested, so
/// the driver's own rejection is what the caller sees.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    api_version: u32,
    layers: &[CString],
    extensions: &[CString],
) -> Result<ash::Instance> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(APPLICATION_NAME)
        .application_version(0)
        .engine_name(ENGINE_NAME)
        .engine_version(0)
        .api_version(api_version);

    let available_layers = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default();
    for layer in layers {
        let found = available_layers
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == layer.as_c_str());
        if !found {
            tracing::warn!("Layer {} not available", layer.to_string_lossy());
        }
    }

    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|e| e.as_ptr()).collect();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layer_names)
        .enabled_extension_names(&extension_names);

    entry
        .create_instance(&create_info, None)
        .map_err(|e| ComputeError::InstanceCreation(e.to_string()))
}

/// Select the first enumerated physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(|e| ComputeError::InstanceCreation(e.to_string()))?;

    devices.first().copied().ok_or(ComputeError::NoDevice)
}
