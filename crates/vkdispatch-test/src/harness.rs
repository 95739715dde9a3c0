//! Headless compute runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use vkdispatch::vk;
use vkdispatch::{
    AppInfo, Buffer, BufferDesc, CommandQueue, Context, DispatchSize, FenceStatus, Pipeline,
    Stopwatch, Submission,
};

use crate::{Result, TestError};

/// Copies every word of binding 0 into binding 1.
pub const COPY_SHADER_WGSL: &str = r"
@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;

@compute @workgroup_size(1)
fn main() {
    let n = arrayLength(&src);
    for (var i = 0u; i < n; i = i + 1u) {
        dst[i] = src[i];
    }
}
";

const FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Compile a WGSL compute entry point to SPIR-V words.
pub fn compile_wgsl_compute(source: &str, entry_point: &str) -> Result<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| TestError::Shader(e.emit_to_string(source)))?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    )
    .validate(&module)
    .map_err(|e| TestError::Shader(format!("validation: {e}")))?;

    let options = naga::back::spv::Options {
        lang_version: (1, 0),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga::ShaderStage::Compute,
        entry_point: entry_point.to_string(),
    };

    let mut writer = naga::back::spv::Writer::new(&options)
        .map_err(|e| TestError::Shader(format!("writer: {e}")))?;
    let mut words = Vec::new();
    writer
        .write(&module, &info, Some(&pipeline_options), &None, &mut words)
        .map_err(|e| TestError::Shader(format!("SPIR-V output: {e}")))?;
    Ok(words)
}

/// Write SPIR-V words to `name` under the system temp directory.
pub fn write_shader(name: &str, words: &[u32]) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(name);
    std::fs::write(&path, bytemuck::cast_slice::<u32, u8>(words))?;
    Ok(path)
}

/// Context on the first device with a compute queue.
///
/// Set `VKDISPATCH_VALIDATION=1` to enable the Khronos validation layer.
pub fn headless_context() -> Result<Context> {
    let validation = std::env::var("VKDISPATCH_VALIDATION").is_ok_and(|v| v == "1");
    Ok(Context::new(&AppInfo::new().validation(validation))?)
}

/// Result of [`run_copy`].
#[derive(Debug)]
pub struct CopyRun {
    /// Contents of the output buffer after the dispatch.
    pub output: Vec<u8>,
    /// Bytes charged to the budget while both buffers were alive.
    pub peak_allocated: u64,
    /// Buffer and pipeline construction.
    pub setup_time: Duration,
    /// Recording, submission and fence wait.
    pub dispatch_time: Duration,
}

/// Upload `input` to binding 0, dispatch `shader_path` once, read binding 1.
pub fn run_copy(
    context: &Context,
    shader_path: &Path,
    input: &[u8],
    output_size: u64,
) -> Result<CopyRun> {
    let mut setup = Stopwatch::start("Setup");
    let src = Buffer::new(context, &BufferDesc::storage(input.len() as u64, 0))?;
    let dst = Buffer::new(context, &BufferDesc::storage(output_size, 1))?;
    let peak_allocated = context.budget().allocated();

    src.map()?.write(input)?;

    let buffers = [&src, &dst];
    let pipeline = Pipeline::new(context, shader_path, "main", &buffers)?;
    let setup_time = setup.stop();

    let mut dispatch = Stopwatch::start("Command Queue");
    let queue = CommandQueue::new(
        context,
        &pipeline,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        DispatchSize::x(1),
    )?;

    let submission = Submission::submit(context, &queue)?;
    if submission.wait(FENCE_TIMEOUT)? == FenceStatus::Pending {
        return Err(TestError::Timeout(FENCE_TIMEOUT));
    }
    let dispatch_time = dispatch.stop();

    let output = dst.map()?.read::<u8>();
    tracing::debug!("Copy dispatch read back {} bytes", output.len());

    Ok(CopyRun {
        output,
        peak_allocated,
        setup_time,
        dispatch_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_shader_compiles() {
        let words = compile_wgsl_compute(COPY_SHADER_WGSL, "main").unwrap();
        assert_eq!(words[0], vkdispatch::shader::SPIRV_MAGIC);
    }

    #[test]
    fn unknown_entry_point_is_rejected() {
        assert!(compile_wgsl_compute(COPY_SHADER_WGSL, "missing").is_err());
    }

    #[test]
    fn bad_wgsl_is_a_shader_error() {
        assert!(matches!(
            compile_wgsl_compute("fn main( {", "main"),
            Err(TestError::Shader(_))
        ));
    }

    #[test]
    fn written_shader_loads_back() {
        let words = compile_wgsl_compute(COPY_SHADER_WGSL, "main").unwrap();
        let path = write_shader(&format!("vkdispatch-harness-{}.spv", std::process::id()), &words)
            .unwrap();
        let loaded = vkdispatch::load_spirv(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, words);
    }
}
