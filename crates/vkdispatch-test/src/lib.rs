//! Test harness for vkdispatch.
//!
//! Compiles WGSL compute shaders to SPIR-V and runs them headless.

pub mod harness;

pub use harness::{
    compile_wgsl_compute, headless_context, run_copy, write_shader, CopyRun, COPY_SHADER_WGSL,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] vkdispatch::ComputeError),
    #[error("Shader compilation failed: {0}")]
    Shader(String),
    #[error("Dispatch did not finish within {0:?}")]
    Timeout(std::time::Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;
