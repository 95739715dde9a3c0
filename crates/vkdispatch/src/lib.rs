//! Single-shot Vulkan compute.
//!
//! This crate provides:
//! - Instance, device and compute queue family selection
//! - Device diagnostics and API version checks
//! - Buffers with dedicated memory and a per-context allocation budget
//! - Compute pipelines with their descriptor set derived from the buffers
//! - One-shot command recording, submission and fence waits
//! - Wall-clock timing of setup and dispatch

pub mod budget;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod handle;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod sync;
pub mod timing;
pub mod version;

pub use budget::{MemoryBudget, Reservation};
pub use capabilities::{ComputeLimits, DeviceReport, GpuVendor, ShaderCoreInfo};
pub use command::{CommandQueue, ComputeRecorder, DispatchPlan, DispatchSize};
pub use context::{AppInfo, Context};
pub use descriptors::{DescriptorResource, DescriptorSetLayoutBuilder};
pub use error::{ComputeError, Result};
pub use memory::{find_memory_type, Buffer, BufferDesc, MappedMemory, MemoryTypeChoice};
pub use pipeline::Pipeline;
pub use shader::load_spirv;
pub use sync::{FenceStatus, Submission};
pub use timing::Stopwatch;
pub use version::{Version, VersionInfo};

pub use ash::vk;
