pub mod io;
pub mod output;
pub mod progress;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use neuronflow_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use neuronflow_core::engine::{variant_schedule, BlendMode, FlipAxis, SlidingWindowInferer};
use neuronflow_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use neuronflow_core::model::{InferenceBackend, OnnxModel};
use neuronflow_core::preprocess::preprocess;
use neuronflow_core::runtime;

use crate::output::OutputRequest;
use crate::progress::BatchProgressBar;

#[derive(Parser)]
#[command(
    name = "neuronflow",
    about = "Sliding-window segmentation inference for microscopy images"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment one image and write the requested outputs.
    Infer(InferArgs),
    /// Print the window plan for an image size as JSON.
    Plan(PlanArgs),
}

#[derive(Args)]
struct InferArgs {
    #[arg(help = "Microscopy image to segment")]
    input: PathBuf,
    #[arg(long, help = "8-bit argmax label map")]
    segmentation: Option<PathBuf>,
    #[arg(long, help = "Binary foreground mask")]
    binary: Option<PathBuf>,
    #[arg(long, help = "Foreground probability threshold for --binary")]
    threshold: Option<f32>,
    #[arg(long, help = "16-bit background probability map")]
    background: Option<PathBuf>,
    #[arg(long, help = "16-bit foreground probability map")]
    foreground: Option<PathBuf>,
    #[arg(
        long = "class",
        value_name = "K=PATH",
        value_parser = parse_class_output,
        help = "16-bit probability map of class K (repeatable)"
    )]
    classes: Vec<(usize, PathBuf)>,
    #[arg(long, help = "ONNX model, relative paths resolve against the models directory")]
    model: Option<PathBuf>,
    #[arg(long, help = "cpu, cuda or tensorrt")]
    backend: Option<String>,
    #[arg(long)]
    device_id: Option<i32>,
    #[arg(long, help = "Disable test-time augmentation")]
    no_tta: bool,
    #[arg(
        long = "flip-axis",
        value_name = "AXIS",
        value_parser = FlipAxis::parse,
        help = "TTA flip axis, height or width (repeatable, replaces the configured axes)"
    )]
    flip_axes: Vec<FlipAxis>,
    #[arg(long, value_name = "MODE", help = "gaussian or constant")]
    blend: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    overlap: Option<f32>,
    #[arg(long, value_name = "H,W", value_parser = parse_patch_size)]
    patch: Option<(usize, usize)>,
    #[arg(long, help = "Seed for TTA noise")]
    seed: Option<u64>,
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args)]
struct PlanArgs {
    height: usize,
    width: usize,
    #[arg(long, value_name = "H,W", value_parser = parse_patch_size)]
    patch: Option<(usize, usize)>,
    #[arg(long)]
    overlap: Option<f32>,
    #[arg(long)]
    batch_size: Option<usize>,
}

fn parse_patch_size(raw: &str) -> Result<(usize, usize), String> {
    let parse = |part: &str| {
        part.trim()
            .parse::<usize>()
            .map_err(|e| format!("invalid patch dimension '{part}': {e}"))
    };
    match raw.split_once(',') {
        Some((h, w)) => Ok((parse(h)?, parse(w)?)),
        None => {
            let side = parse(raw)?;
            Ok((side, side))
        }
    }
}

fn parse_class_output(raw: &str) -> Result<(usize, PathBuf), String> {
    let (class, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected K=PATH, got '{raw}'"))?;
    let class = class
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("invalid class index '{class}': {e}"))?;
    if path.is_empty() {
        return Err(format!("missing output path for class {class}"));
    }
    Ok((class, PathBuf::from(path)))
}

impl InferArgs {
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(model) = &self.model {
            config.model.path = model.clone();
        }
        if let Some(backend) = &self.backend {
            config.model.backend = InferenceBackend::from_str_lossy(backend);
        }
        if let Some(device_id) = self.device_id {
            config.model.device_id = device_id;
        }
        if self.no_tta {
            config.tta.enabled = false;
        }
        if !self.flip_axes.is_empty() {
            config.tta.flip_axes = self.flip_axes.clone();
        }
        if let Some(blend) = &self.blend {
            config.inference.blend_mode = BlendMode::from_str_lossy(blend);
        }
        if let Some(batch_size) = self.batch_size {
            config.inference.batch_size = batch_size;
        }
        if let Some(overlap) = self.overlap {
            config.inference.overlap = overlap;
        }
        if let Some((h, w)) = self.patch {
            config.inference.patch_size = [h, w];
        }
        if self.seed.is_some() {
            config.tta.seed = self.seed;
        }
        if self.threshold.is_some() {
            config.output.threshold = self.threshold;
        }
    }

    fn output_request(&self, threshold: Option<f32>) -> OutputRequest {
        OutputRequest {
            segmentation: self.segmentation.clone(),
            binary: self.binary.clone(),
            threshold,
            background: self.background.clone(),
            foreground: self.foreground.clone(),
            classes: self.classes.clone(),
        }
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let runtime_libs = runtime::setup_runtime_libs();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime_libs.log();
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Infer(args) => run_infer(&args, &resolved_data_dir),
        Commands::Plan(args) => run_plan(&args, &resolved_data_dir),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter =
        parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    let installed = match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let file_filter =
                parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_filter),
                );
            tracing::subscriber::set_global_default(subscriber)
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            let installed = tracing::subscriber::set_global_default(subscriber);
            warn!(
                attempted_log_dir = ?fallback.attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable, continuing with console-only logging"
            );
            installed
        }
    };

    if let Err(error) = installed {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash report hook unavailable"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    let path = config_path(data_dir);
    AppConfig::load_from_path(&path)
}

fn run_infer(args: &InferArgs, data_dir: &Path) -> Result<()> {
    initialize_data_dir(data_dir)?;
    let mut config = load_config(data_dir)?;
    args.apply_to(&mut config);

    let request = args.output_request(config.output.threshold);
    if request.is_empty() {
        bail!(
            "no output requested: pass --segmentation, --binary, --background, --foreground or --class"
        );
    }

    let inference = config
        .to_inference_config()
        .context("invalid inference settings")?;
    let inferer = SlidingWindowInferer::new(inference)?;

    let mut image = io::load_image(&args.input)?;
    preprocess(&mut image, &config.preprocess).context("failed to preprocess image")?;
    let (channels, height, width) = image.dim();

    let model_config = config.resolved_model_config(data_dir);
    let model = OnnxModel::load(&model_config)?;

    let plan = inferer.plan((height, width))?;
    let variants = variant_schedule(&inferer.config().tta).len();
    let total_batches = plan.batch_count(inferer.config().batch_size) * variants;
    info!(
        input = %args.input.display(),
        channels,
        height,
        width,
        windows = plan.len(),
        variants,
        fp16 = model.is_fp16(),
        "Segmenting image"
    );

    let progress = if args.no_progress {
        BatchProgressBar::hidden()
    } else {
        BatchProgressBar::new(total_batches)
    };
    let started = Instant::now();
    let prediction = inferer
        .infer_with_progress(image.view(), &model, &mut |p| progress.update(p))
        .with_context(|| format!("inference failed for {}", args.input.display()))?;
    progress.finish();
    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        classes = prediction.dim().0,
        "Inference finished"
    );

    let probabilities = output::decode(prediction, &config.output)?;
    output::write_outputs(&probabilities, &request)?;
    Ok(())
}

fn run_plan(args: &PlanArgs, data_dir: &Path) -> Result<()> {
    let mut config = load_config(data_dir)?;
    if let Some((h, w)) = args.patch {
        config.inference.patch_size = [h, w];
    }
    if let Some(overlap) = args.overlap {
        config.inference.overlap = overlap;
    }
    if let Some(batch_size) = args.batch_size {
        config.inference.batch_size = batch_size;
    }

    let inferer = SlidingWindowInferer::new(config.to_inference_config()?)?;
    let plan = inferer.plan((args.height, args.width))?;
    let summary = serde_json::json!({
        "batches": plan.batch_count(inferer.config().batch_size),
        "variants": variant_schedule(&inferer.config().tta)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        "plan": plan,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer_args(extra: &[&str]) -> InferArgs {
        let mut argv = vec!["neuronflow", "infer", "cells.tif"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("valid arguments").command {
            Commands::Infer(args) => args,
            Commands::Plan(_) => panic!("expected infer subcommand"),
        }
    }

    #[test]
    fn parses_patch_size_pairs_and_squares() {
        assert_eq!(parse_patch_size("256,128"), Ok((256, 128)));
        assert_eq!(parse_patch_size(" 64 , 32 "), Ok((64, 32)));
        assert_eq!(parse_patch_size("512"), Ok((512, 512)));
        assert!(parse_patch_size("a,b").is_err());
    }

    #[test]
    fn parses_class_outputs() {
        assert_eq!(
            parse_class_output("2=out/class2.png"),
            Ok((2, PathBuf::from("out/class2.png")))
        );
        assert!(parse_class_output("out.png").is_err());
        assert!(parse_class_output("x=out.png").is_err());
        assert!(parse_class_output("1=").is_err());
    }

    #[test]
    fn cli_flags_override_config_values() {
        let args = infer_args(&[
            "--binary",
            "mask.png",
            "--threshold",
            "0.3",
            "--no-tta",
            "--batch-size",
            "8",
            "--overlap",
            "0.25",
            "--patch",
            "128,96",
            "--seed",
            "9",
            "--backend",
            "trt",
            "--device-id",
            "1",
            "--model",
            "nuclei.onnx",
            "--flip-axis",
            "w",
            "--blend",
            "constant",
        ]);
        let mut config = AppConfig::default();
        args.apply_to(&mut config);

        assert!(!config.tta.enabled);
        assert_eq!(config.tta.seed, Some(9));
        assert_eq!(config.inference.batch_size, 8);
        assert_eq!(config.inference.overlap, 0.25);
        assert_eq!(config.inference.patch_size, [128, 96]);
        assert_eq!(config.model.backend, InferenceBackend::Tensorrt);
        assert_eq!(config.model.device_id, 1);
        assert_eq!(config.model.path, PathBuf::from("nuclei.onnx"));
        assert_eq!(config.output.threshold, Some(0.3));
        assert_eq!(config.tta.flip_axes, vec![FlipAxis::Width]);
        assert_eq!(config.inference.blend_mode, BlendMode::Constant);
    }

    #[test]
    fn unknown_flip_axis_is_a_usage_error() {
        let parsed =
            Cli::try_parse_from(["neuronflow", "infer", "cells.tif", "--flip-axis", "depth"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn absent_flags_keep_config_values() {
        let args = infer_args(&["--segmentation", "labels.png"]);
        let mut config = AppConfig::default();
        config.tta.seed = Some(5);
        config.output.threshold = Some(0.7);
        args.apply_to(&mut config);

        assert_eq!(config, {
            let mut expected = AppConfig::default();
            expected.tta.seed = Some(5);
            expected.output.threshold = Some(0.7);
            expected
        });
    }

    #[test]
    fn repeated_class_flags_collect_in_order() {
        let args = infer_args(&["--class", "1=a.png", "--class", "3=b.png"]);
        let request = args.output_request(None);
        assert_eq!(
            request.classes,
            vec![(1, PathBuf::from("a.png")), (3, PathBuf::from("b.png"))]
        );
        assert!(!request.is_empty());
    }

    #[test]
    fn infer_without_outputs_has_empty_request() {
        assert!(infer_args(&[]).output_request(None).is_empty());
    }

    #[test]
    fn plan_subcommand_parses_dimensions() {
        let cli = Cli::try_parse_from(["neuronflow", "plan", "2048", "1024", "--patch", "256"])
            .expect("valid arguments");
        match cli.command {
            Commands::Plan(args) => {
                assert_eq!((args.height, args.width), (2048, 1024));
                assert_eq!(args.patch, Some((256, 256)));
            }
            Commands::Infer(_) => panic!("expected plan subcommand"),
        }
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "neuronflow",
            "plan",
            "64",
            "64",
            "-vv",
            "--data-dir",
            "/tmp/nf",
        ])
        .expect("valid arguments");
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/nf")));
    }
}
