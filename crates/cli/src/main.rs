use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flashseq_config::{DeviceDescriptor, OperationScript};
use flashseq_core::bus::SystemBus;
use flashseq_core::metrics::OperationMetrics;
use flashseq_core::snapshot::DeviceSnapshot;
use flashseq_core::{Bus, EraseMode, FlashSequencer, Region, Scope, SequencerConfig};
use flashseq_loader::FlashLayout;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

mod script;

const EXIT_PASS: u8 = 0;
const EXIT_ASSERT_FAIL: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash controller sequencer and simulator", long_about = None)]
struct Cli {
    /// Enable register-level tracing
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an operation script against the simulated controller
    Run(RunArgs),
    /// Erase, program and verify an ELF image in the simulated main array
    Program(ProgramArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the operation script (YAML)
    #[arg(short, long)]
    script: PathBuf,

    /// Device descriptor (YAML); overrides the script's `inputs.device`
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Directory receiving result.json
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ProgramArgs {
    /// Firmware image (ELF)
    #[arg(short, long)]
    image: PathBuf,

    /// Device descriptor (YAML); defaults to the built-in HK32F39A layout
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Write a JSON snapshot of the controller after programming
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunConfig {
    script: String,
    device: String,
}

#[derive(Debug, Serialize)]
struct RunResult<'a> {
    status: &'static str,
    final_outcome: flashseq_config::Outcome,
    script_hash: String,
    config: RunConfig,
    steps: &'a [script::StepRecord],
    assertions: &'a [script::AssertionRecord],
    metrics: flashseq_core::metrics::MetricsSummary,
    snapshot: DeviceSnapshot,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let code = match cli.command {
        Command::Run(args) => run(args),
        Command::Program(args) => program(args),
    };
    ExitCode::from(code)
}

fn load_device(path: Option<&Path>) -> anyhow::Result<DeviceDescriptor> {
    match path {
        Some(path) => {
            info!("Loading device descriptor: {:?}", path);
            DeviceDescriptor::from_file(path)
        }
        None => {
            info!("Using built-in HK32F39A layout");
            Ok(DeviceDescriptor::hk32f39a())
        }
    }
}

fn build_sequencer(device: &DeviceDescriptor) -> anyhow::Result<FlashSequencer<SystemBus>> {
    let bus = SystemBus::from_config(device)?;
    let config = SequencerConfig::from_descriptor(device)?;
    Ok(FlashSequencer::new(bus, config))
}

fn run(args: RunArgs) -> u8 {
    let prepared = (|| -> anyhow::Result<_> {
        let raw = std::fs::read(&args.script)
            .with_context(|| format!("Failed to read script {:?}", args.script))?;
        let script = OperationScript::from_file(&args.script)?;

        let device_path = args.device.clone().or_else(|| {
            script.inputs.device.as_ref().map(|d| {
                args.script
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(d)
            })
        });
        let device = load_device(device_path.as_deref())?;
        let mut seq = build_sequencer(&device)?;
        if let Some(latency) = script.limits.busy_latency {
            seq.bus_mut().flash.set_busy_latency(latency);
        }

        let config = RunConfig {
            script: args.script.display().to_string(),
            device: device_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| device.name.clone()),
        };
        Ok((script, seq, config, format!("{:x}", Sha256::digest(&raw))))
    })();

    let (script, mut seq, config, script_hash) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let metrics = Arc::new(OperationMetrics::new());
    seq.add_observer(metrics.clone());

    info!("Running {} steps", script.steps.len());
    let report = script::run_script(&mut seq, &script);
    let passed = report.passed();

    let result = RunResult {
        status: if passed { "pass" } else { "fail" },
        final_outcome: report.final_outcome,
        script_hash,
        config,
        steps: &report.steps,
        assertions: &report.assertions,
        metrics: metrics.summary(),
        snapshot: DeviceSnapshot::capture(seq.bus()),
    };

    if let Some(dir) = &args.output_dir {
        if let Err(e) = write_json(&dir.join("result.json"), &result, Some(dir)) {
            error!("Failed to write result: {:#}", e);
            return EXIT_RUNTIME_ERROR;
        }
    }

    if passed {
        info!("Script passed ({:?})", report.final_outcome);
        EXIT_PASS
    } else {
        error!("Script failed ({:?})", report.final_outcome);
        EXIT_ASSERT_FAIL
    }
}

fn program(args: ProgramArgs) -> u8 {
    let prepared = (|| -> anyhow::Result<_> {
        let device = load_device(args.device.as_deref())?;
        let seq = build_sequencer(&device)?;
        info!("Loading image: {:?}", args.image);
        let image = flashseq_loader::load_elf(&args.image)?;
        let layout = FlashLayout::plan(&image, &seq.config().geometry)?;
        Ok((seq, image, layout))
    })();

    let (mut seq, image, layout) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    match flash_image(&mut seq, &image, &layout) {
        Ok(digest) => info!("Image verified, sha256 {}", digest),
        Err(e) => {
            error!("Programming failed: {:#}", e);
            return EXIT_RUNTIME_ERROR;
        }
    }

    if let Some(path) = &args.snapshot {
        let snapshot = DeviceSnapshot::capture(seq.bus());
        if let Err(e) = write_json(path, &snapshot, path.parent()) {
            error!("Failed to write snapshot: {:#}", e);
            return EXIT_RUNTIME_ERROR;
        }
    }
    EXIT_PASS
}

/// Erases the touched pages, programs the image and checks the read-back
/// digest against the image bytes.
fn flash_image(
    seq: &mut FlashSequencer<SystemBus>,
    image: &flashseq_core::memory::ProgramImage,
    layout: &FlashLayout,
) -> anyhow::Result<String> {
    seq.unlock(Region::Main)?;
    for page in &layout.pages {
        seq.erase(EraseMode::Page, Scope::Main, *page)
            .with_context(|| format!("Erasing page {:#010x}", page))?;
    }
    for chunk in &layout.chunks {
        seq.program(Scope::Main, chunk.address, &chunk.words)
            .with_context(|| format!("Programming {:#010x}", chunk.address))?;
    }
    seq.lock(Region::Main)?;
    info!(
        "Programmed {} bytes in {} chunks over {} pages",
        image.total_size(),
        layout.chunks.len(),
        layout.pages.len()
    );

    let mut expected = Sha256::new();
    let mut actual = Sha256::new();
    for segment in &image.segments {
        expected.update(&segment.data);
        for (i, _) in segment.data.iter().enumerate() {
            let addr = segment.start_addr + i as u64;
            let word = seq.bus_mut().read_u32(addr & !3)?;
            actual.update([(word >> ((addr & 3) * 8)) as u8]);
        }
    }
    let expected = format!("{:x}", expected.finalize());
    let actual = format!("{:x}", actual.finalize());
    if expected != actual {
        anyhow::bail!("Verification failed: expected {}, read back {}", expected, actual);
    }
    Ok(actual)
}

fn write_json<T: Serialize>(path: &Path, value: &T, dir: Option<&Path>) -> anyhow::Result<()> {
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    info!("Wrote {:?}", path);
    Ok(())
}
