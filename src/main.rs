use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use linc_detect::{
    config::{Device, ModelSpec, OnnxConfig, DEFAULT_MODEL},
    detection::DetectionPipeline,
    models::{Checkpoint, LincDetector},
    web::serve,
    Config,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linc-detect")]
#[command(about = "Animal body-part detection service backed by an ONNX Faster R-CNN")]
#[command(args_conflicts_with_subcommands = true)]
struct Args {
    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve(ServeArgs),
    /// Detect on local image files and print JSON results
    Detect(DetectArgs),
}

#[derive(ClapArgs)]
struct ModelArgs {
    /// Checkpoint served at /detect
    #[arg(long = "model", env = "MODEL_PATH", default_value = "models/body_parts.onnx")]
    model_path: PathBuf,

    /// Label names of the default checkpoint (defaults to <model>.labels.json)
    #[arg(long = "labels", env = "LABELS_PATH")]
    labels_path: Option<PathBuf>,

    /// Execution device
    #[arg(long, env = "DEVICE", value_enum, default_value = "cpu")]
    device: Device,
}

#[derive(ClapArgs)]
struct ServeArgs {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8081")]
    bind: String,

    #[command(flatten)]
    model: ModelArgs,

    /// Checkpoint served at /detect_lion
    #[arg(long, env = "LION_MODEL_PATH")]
    lion_model: Option<PathBuf>,

    /// Checkpoint served at /detect_whisker
    #[arg(long, env = "WHISKER_MODEL_PATH")]
    whisker_model: Option<PathBuf>,

    /// Additional NAME=PATH checkpoints, served at /detect_NAME
    #[arg(long = "extra-model")]
    extra_models: Vec<ModelSpec>,

    /// Confidence threshold when a request sends none
    #[arg(long, env = "DEFAULT_DETECTION_CONFIDENCE", default_value_t = 0.5)]
    default_confidence: f32,

    /// Maximum number of images per request
    #[arg(long, env = "MAX_IMAGES_ACCEPTED", default_value_t = 8)]
    max_images: usize,

    /// Concurrent requests admitted per detection endpoint
    #[arg(long, env = "MAX_CONCURRENT_REQUESTS", default_value_t = 5)]
    max_concurrent: usize,

    /// Enable development mode
    #[arg(long)]
    dev: bool,
}

#[derive(ClapArgs)]
struct DetectArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Confidence threshold
    #[arg(long, default_value_t = 0.5)]
    conf: f32,

    /// Images to run through the model
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .init();

    match args.command {
        Some(Command::Detect(detect)) => run_detect(detect),
        Some(Command::Serve(serve)) => run_serve(serve).await,
        None => run_serve(args.serve).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    tracing::info!("Starting LINC detection service...");
    tracing::info!("Bind address: {}", args.bind);

    let mut models = vec![ModelSpec::new(DEFAULT_MODEL, args.model.model_path)
        .with_labels(args.model.labels_path)];
    if let Some(path) = args.lion_model {
        models.push(ModelSpec::new("lion", path));
    }
    if let Some(path) = args.whisker_model {
        models.push(ModelSpec::new("whisker", path));
    }
    models.extend(args.extra_models);

    let config = Config::new(
        args.bind,
        models,
        args.model.device,
        args.default_confidence,
        args.max_images,
        args.max_concurrent,
        args.dev,
    )?;

    serve(config).await?;
    Ok(())
}

fn run_detect(args: DetectArgs) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.conf),
        "confidence {} must be between 0.0 and 1.0",
        args.conf
    );

    let spec = ModelSpec::new(DEFAULT_MODEL, &args.model.model_path).with_labels(args.model.labels_path);
    let checkpoint = Checkpoint::load(&spec).context("loading checkpoint")?;

    let detector = LincDetector::new(DEFAULT_MODEL, checkpoint, args.model.device, &OnnxConfig::default())
        .context("building detector")?;

    let results = DetectionPipeline::process_paths(&detector, args.images.as_slice(), args.conf)
        .context("running detection")?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
