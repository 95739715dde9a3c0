//! vkdispatch runner
//!
//! Loads a SPIR-V compute shader, binds an input buffer at binding 0 and an
//! output buffer at binding 1, dispatches once, and checks that the output
//! starts with the input.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vkdispatch-run -- <SHADER.spv> [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vkdispatch::vk;
use vkdispatch::{
    AppInfo, Buffer, BufferDesc, CommandQueue, Context, DispatchSize, FenceStatus, Pipeline,
    Stopwatch, Submission,
};

/// Runner options parsed from the command line.
#[derive(Debug)]
struct RunConfig {
    shader: PathBuf,
    entry: String,
    input_size: u64,
    output_size: u64,
    groups: u32,
    timeout: Duration,
    validation: bool,
}

impl RunConfig {
    fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut shader = None;
        let mut config = Self {
            shader: PathBuf::new(),
            entry: "main".to_string(),
            input_size: 2052,
            output_size: 1_050_629,
            groups: 1,
            timeout: Duration::from_secs(1),
            validation: false,
        };

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "-e" | "--entry" => {
                    config.entry = option_value(&args, i)?.clone();
                    i += 1;
                }
                "--input-size" => {
                    config.input_size = option_value(&args, i)?.parse()?;
                    i += 1;
                }
                "--output-size" => {
                    config.output_size = option_value(&args, i)?.parse()?;
                    i += 1;
                }
                "-g" | "--groups" => {
                    config.groups = option_value(&args, i)?.parse()?;
                    i += 1;
                }
                "--timeout-ms" => {
                    config.timeout = Duration::from_millis(option_value(&args, i)?.parse()?);
                    i += 1;
                }
                "--validation" => config.validation = true,
                other if other.starts_with('-') => bail!("unknown option {other}"),
                path => shader = Some(PathBuf::from(path)),
            }
            i += 1;
        }

        config.shader = shader.context("missing shader path (see --help)")?;
        if config.output_size < config.input_size {
            bail!(
                "output size {} is smaller than input size {}",
                config.output_size,
                config.input_size
            );
        }
        Ok(config)
    }
}

fn option_value(args: &[String], i: usize) -> anyhow::Result<&String> {
    args.get(i + 1)
        .with_context(|| format!("{} expects a value", args[i]))
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::from_args()?;
    let mut main_watch = Stopwatch::start("Main");
    let context = Context::new(&AppInfo::new().validation(config.validation))
        .context("Failed to create Vulkan context")?;

    if let Err(e) = run(&context, &config) {
        eprintln!("{}", context.print_debug_info());
        return Err(e);
    }

    info!("Output matches input ({} bytes)", config.input_size);
    main_watch.stop();
    Ok(())
}

fn run(context: &Context, config: &RunConfig) -> anyhow::Result<()> {
    let mut setup_watch = Stopwatch::start("Setup");
    let input = Buffer::new(context, &BufferDesc::storage(config.input_size, 0))
        .context("Failed to create input buffer")?;
    let output = Buffer::new(context, &BufferDesc::storage(config.output_size, 1))
        .context("Failed to create output buffer")?;

    let pattern: Vec<u8> = (0..config.input_size).map(|i| (i % 251) as u8).collect();
    input.map()?.write(&pattern)?;

    let buffers = [&input, &output];
    let pipeline = Pipeline::new(context, &config.shader, &config.entry, &buffers)
        .with_context(|| format!("Failed to build pipeline from {}", config.shader.display()))?;
    setup_watch.stop();

    let mut command_watch = Stopwatch::start("Command Queue");
    let queue = CommandQueue::new(
        context,
        &pipeline,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        DispatchSize::x(config.groups),
    )?;

    let submission = Submission::submit(context, &queue)?;
    while submission.wait(config.timeout)? == FenceStatus::Pending {
        warn!("Dispatch still running after {:?}, waiting again", config.timeout);
    }
    command_watch.stop();

    let result = output.map()?.read::<u8>();
    let result = &result[..pattern.len()];
    if let Some(offset) = result.iter().zip(&pattern).position(|(a, b)| a != b) {
        bail!(
            "output differs from input at byte {offset}: expected {}, got {}",
            pattern[offset],
            result[offset]
        );
    }
    Ok(())
}

fn print_help() {
    eprintln!(
        "vkdispatch runner

USAGE:
    cargo run -p vkdispatch-run -- <SHADER.spv> [OPTIONS]

OPTIONS:
    -e, --entry <NAME>      Shader entry point (default: main)
    --input-size <BYTES>    Size of the binding 0 buffer (default: 2052)
    --output-size <BYTES>   Size of the binding 1 buffer (default: 1050629)
    -g, --groups <N>        Workgroups along x (default: 1)
    --timeout-ms <MS>       Fence wait timeout per attempt (default: 1000)
    --validation            Enable VK_LAYER_KHRONOS_validation
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
