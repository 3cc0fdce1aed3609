#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod bootstrap;

use std::{
    fs::{self, File},
    sync::Arc,
};

use ash::vk;
use clap::Parser;
use eyre::{OptionExt, WrapErr};
use mgpu::{
    CommandSubmissionDistributor, CrossDeviceSynchronizer, FrameDistributionMode,
    FrameDistributor, GpuCommandSubmission, GpuDeviceRegistry, InstanceRef,
    MemoryPlacementManager, PlacementStrategy, RegistryConfig,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::bootstrap::{Bootstrap, VulkanLogLevel};

/// Per-device fence wait before a frame is declared stuck.
const GPU_TIMEOUT_NS: u64 = 5_000_000_000;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    #[default]
    Info,
    Debug,
    Warn,
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliDistributionMode {
    #[default]
    Horizontal,
    Vertical,
    Quadrants,
    Alternate,
}

impl From<CliDistributionMode> for FrameDistributionMode {
    fn from(value: CliDistributionMode) -> Self {
        match value {
            CliDistributionMode::Horizontal => FrameDistributionMode::SplitHorizontal,
            CliDistributionMode::Vertical => FrameDistributionMode::SplitVertical,
            CliDistributionMode::Quadrants => FrameDistributionMode::SplitQuadrants,
            CliDistributionMode::Alternate => FrameDistributionMode::AlternateFrame,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "info")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    /// Upper bound on the number of GPUs to bring up
    #[arg(long, default_value_t = 3)]
    gpus: u32,
    #[arg(long, default_value = "horizontal")]
    mode: CliDistributionMode,
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    #[arg(long, default_value_t = 3)]
    frames: u64,
    /// Do not request a queue from a dedicated transfer family
    #[arg(long)]
    no_transfer_queue: bool,
    /// Comma-separated relative workload per GPU, e.g. `3,1`
    #[arg(long, value_delimiter = ',')]
    workloads: Option<Vec<u32>>,
}

fn init_tracing(cli_args: &CliArgs) -> eyre::Result<()> {
    if cli_args.tracing_log_level == TracingLogLevel::Off {
        return Ok(());
    }

    let app_dirs = directories::ProjectDirs::from("", "mgpu", "mgpu-demo");
    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&log_dir)?;

    let mut log_file_path = log_dir.clone();
    log_file_path.push("log-file");
    log_file_path.set_extension("txt");
    let log_file = File::create(&log_file_path)?;
    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    println!("log_file_path: {}", log_file_path.display());
    println!("cli_args: {:#?}", cli_args);

    let stdout_log = tracing_subscriber::fmt::layer().pretty();

    tracing_subscriber::registry()
        .with(
            stdout_log
                .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                    cli_args.tracing_log_level.into(),
                ))
                .and_then(file_log),
        )
        .init();
    Ok(())
}

/// Fill pattern for `gpu` in `frame`, so every shard is recognizable in a
/// capture.
fn fill_pattern(gpu: u32, frame: u64) -> u32 {
    ((gpu + 1) << 24) | (frame as u32 & 0x00ff_ffff)
}

/// Record, submit and retire one frame on every GPU.
///
/// Each GPU clears its shard of the frame buffer. GPU 0 composes, so its
/// submission waits on every other GPU's frame through a cross-device
/// barrier.
fn run_frame(
    frame: u64,
    registry: &GpuDeviceRegistry,
    distributor: &mut FrameDistributor,
    submitter: &CommandSubmissionDistributor,
    synchronizer: &CrossDeviceSynchronizer,
    memory: &MemoryPlacementManager,
    frame_buffer: mgpu::BufferId,
) -> eyre::Result<()> {
    let _span = tracing::info_span!("frame", frame).entered();

    for region in distributor.regions()? {
        tracing::info!(
            "GPU {} renders {}x{} at ({}, {})",
            region.gpu_index,
            region.width,
            region.height,
            region.offset_x,
            region.offset_y
        );
    }

    for shard in memory.buffer_shards(frame_buffer) {
        let command_buffer = submitter
            .begin_command_buffer(shard.gpu_index)?
            .ok_or_eyre("GPU vanished while recording")?;
        submitter.record_command_buffer(command_buffer, |gpu, raw| {
            // SAFETY: the buffer is recording on this GPU under its pool
            // lock, the shard buffer was created there with TRANSFER_DST
            // usage, and WHOLE_SIZE is always in bounds.
            unsafe {
                gpu.cmd_fill_buffer(
                    raw,
                    shard.buffer,
                    0,
                    vk::WHOLE_SIZE,
                    fill_pattern(shard.gpu_index, frame),
                )
            }
        })?;
        submitter.end_command_buffer(command_buffer)?;
    }

    let count = registry.active_gpu_count();
    for src in 1..count {
        synchronizer.insert_inter_gpu_barrier_at(
            src,
            0,
            frame,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        );
    }

    let submissions: Vec<GpuCommandSubmission> = (0..count)
        .map(|gpu| {
            let mut submission =
                GpuCommandSubmission::new(gpu, submitter.drain_outstanding(gpu));
            synchronizer.encode_pending_barriers(&mut submission);
            submission
        })
        .collect();
    submitter.submit_multi_gpu_frame(&submissions)?;

    // GPU 0 last: its work is gated on everyone else publishing the frame.
    for gpu in (1..count).chain(0..1) {
        if !submitter.wait_for_gpu_completion(gpu, GPU_TIMEOUT_NS) {
            eyre::bail!("GPU {gpu} did not finish frame {frame}");
        }
        synchronizer.signal_frame_complete(gpu, frame);
    }

    distributor.advance_frame();
    Ok(())
}

/// Upload a small pattern through pinned host memory and replicate it to
/// every GPU.
fn run_replication(memory: &MemoryPlacementManager) -> eyre::Result<()> {
    const WORDS: usize = 64;
    let bytes = (WORDS * size_of::<u32>()) as vk::DeviceSize;

    let staging = memory.allocate_buffer(
        vk::BufferUsageFlags::empty(),
        bytes,
        PlacementStrategy::PinnedHost,
        None,
    )?;
    let replicated = memory.allocate_buffer(
        vk::BufferUsageFlags::STORAGE_BUFFER,
        bytes,
        PlacementStrategy::Replicated,
        None,
    )?;

    let pattern: Vec<u32> = (0..WORDS as u32).collect();
    memory.write_pod(staging, 0, &pattern)?;
    let home = memory
        .buffer_shards(staging)
        .first()
        .map(|s| s.gpu_index)
        .ok_or_eyre("pinned buffer has no home GPU")?;

    memory
        .copy_buffer_between_gpus(home, home, staging, replicated, bytes)
        .wrap_err("staging upload")?;
    memory
        .replicate_buffer_to_all_gpus(replicated, bytes)
        .wrap_err("replication")?;
    tracing::info!(
        "Replicated {bytes} bytes to {} GPU(s)",
        memory.buffer_shards(replicated).len()
    );

    memory.free_buffer(replicated);
    memory.free_buffer(staging);
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();
    init_tracing(&cli_args)?;

    //SAFETY: Loads vulkan via libloading which is kinda unsafe but we're fine
    let bootstrap = unsafe {
        Bootstrap::new(c"mgpu-demo", cli_args.graphics_debug_level.map(Into::into))
    }?;
    tracing::debug!("{bootstrap:?}");
    tracing::info!("Vulkan {} instance ready", bootstrap.version());

    // SAFETY: bootstrap is declared first, so it is dropped after every mgpu
    // object below.
    let instance = unsafe { InstanceRef::new(bootstrap.ash_instance()) };

    let mut registry = GpuDeviceRegistry::new();
    registry.initialize_multi_gpu_with(
        &instance,
        RegistryConfig {
            desired_gpu_count: cli_args.gpus,
            dedicated_transfer_queue: !cli_args.no_transfer_queue,
        },
    )?;
    for gpu in registry.available_gpus() {
        tracing::info!(
            "GPU {}: {} (async compute: {}, transfer queue: {})",
            gpu.ordinal(),
            gpu.name(),
            registry.supports_async_compute_on_gpu(gpu.ordinal()),
            gpu.has_transfer_queue()
        );
    }
    let registry = Arc::new(registry);

    let mut distributor = FrameDistributor::new(Arc::clone(&registry));
    distributor.set_distribution_mode(cli_args.mode.into());
    distributor.set_frame_resolution(cli_args.width, cli_args.height);

    let submitter =
        CommandSubmissionDistributor::new(Arc::clone(&registry), distributor.workload_hint());
    if let Some(workloads) = &cli_args.workloads {
        submitter.balance_workload_across_gpus(workloads);
    }
    let synchronizer = CrossDeviceSynchronizer::new(Arc::clone(&registry))?;
    let memory = MemoryPlacementManager::new(Arc::clone(&registry));

    let frame_bytes = cli_args.width as vk::DeviceSize * cli_args.height as vk::DeviceSize * 4;
    let frame_buffer = memory.allocate_buffer(
        vk::BufferUsageFlags::STORAGE_BUFFER,
        frame_bytes,
        PlacementStrategy::Distributed,
        None,
    )?;

    for frame in 1..=cli_args.frames {
        run_frame(
            frame,
            &registry,
            &mut distributor,
            &submitter,
            &synchronizer,
            &memory,
            frame_buffer,
        )?;
    }

    if registry.supports_memory_sharing() {
        run_replication(&memory)?;
    } else {
        tracing::info!("Single GPU active, skipping replication");
    }

    memory.free_buffer(frame_buffer);
    tracing::info!("Done after {} frame(s)", cli_args.frames);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let args = CliArgs::parse_from(["mgpu-demo"]);

        assert_eq!(args.gpus, 3);
        assert_eq!(args.mode, CliDistributionMode::Horizontal);
        assert_eq!((args.width, args.height), (1920, 1080));
        assert!(!args.no_transfer_queue);
        assert!(args.workloads.is_none());
    }

    #[test]
    fn cli_parses_workloads_and_mode() {
        let args = CliArgs::parse_from([
            "mgpu-demo",
            "--mode",
            "quadrants",
            "--workloads",
            "3,1,2",
            "--no-transfer-queue",
        ]);

        assert_eq!(
            FrameDistributionMode::from(args.mode),
            FrameDistributionMode::SplitQuadrants
        );
        assert_eq!(args.workloads, Some(vec![3, 1, 2]));
        assert!(args.no_transfer_queue);
    }

    #[test]
    fn fill_pattern_tags_gpu_and_frame() {
        assert_eq!(fill_pattern(0, 1), 0x0100_0001);
        assert_eq!(fill_pattern(2, 0x0123_4567), 0x0323_4567);
    }
}
