//! Compute error types.

use crate::version::Version;
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building or running compute work.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// The loaded Vulkan API is older than the requested one.
    #[error("Vulkan API {target} is not supported (system has version: {loaded})")]
    UnsupportedVersion { loaded: Version, target: Version },

    /// The Vulkan loader or instance could not be created.
    #[error("Instance creation failed: {0}")]
    InstanceCreation(String),

    /// No physical device was enumerated.
    #[error("No Vulkan physical device found")]
    NoDevice,

    /// No queue family exposes the requested capability.
    #[error("No queue family supports {0:?}")]
    NoQueueFamily(vk::QueueFlags),

    /// Logical device creation failed.
    #[error("Device creation failed: {0}")]
    DeviceCreation(vk::Result),

    /// Invalid configuration rejected before reaching the driver.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Buffer handle creation failed.
    #[error("Buffer creation failed: {0}")]
    BufferCreation(vk::Result),

    /// No memory type provides the requested property flags.
    #[error("No memory type supports {0:?}")]
    NoMemoryType(vk::MemoryPropertyFlags),

    /// The allocation would exceed the backing heap.
    #[error(
        "Out of device memory: requested {requested} bytes with {allocated} already allocated \
         on a heap of {capacity} bytes ({overage} bytes over)"
    )]
    OutOfMemory {
        requested: u64,
        allocated: u64,
        capacity: u64,
        overage: u64,
    },

    /// Device memory allocation or binding failed.
    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(vk::Result),

    /// Host mapping failed.
    #[error("Memory map failed: {0}")]
    MapFailed(String),

    /// Shader module, layout, pool, set or pipeline creation failed.
    #[error("Pipeline creation failed at {stage}: {reason}")]
    PipelineCreation { stage: &'static str, reason: String },

    /// Shader file does not exist.
    #[error("Shader file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Shader file could not be read or decoded.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Command buffer allocation or recording failed.
    #[error("Command recording failed: {0}")]
    CommandRecording(vk::Result),

    /// Queue submission or fence wait failed.
    #[error("Submission failed: {0}")]
    Submission(vk::Result),

    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

impl ComputeError {
    pub(crate) fn pipeline(stage: &'static str, reason: impl ToString) -> Self {
        Self::PipelineCreation {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, ComputeError>;
