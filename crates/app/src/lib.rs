use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mirage_core::config::{self, AppConfig};
use mirage_core::logging::{select_log_filter, DEFAULT_LOG_FILTER};
use mirage_core::pipeline::{Pipeline, ResizeBucket};

/// How often the host-side poller samples the pipeline's telemetry handle.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "mirage", about = "AnimeGAN-style image-to-image generation")]
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

    #[arg(long, global = true, help = "Data directory holding config.toml and model_full/")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the model once to warm caches, then release it
    Preheat,
    /// Generate a stylized image from an input image
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(help = "Input image (PNG or JPEG)")]
    input: PathBuf,

    #[arg(help = "Output image path")]
    output: PathBuf,

    #[arg(
        long,
        value_name = "BUCKET",
        default_value = "none",
        help = "Resize bucket, matched exactly: \"s\" (100px long side), \"m\" (250px), \"l\" (500px); any other value keeps the original resolution"
    )]
    resize: String,

    #[arg(long, help = "Run the session with reduced (f16) floating-point precision")]
    fp16: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_filter.as_deref());

    let data_dir = config::data_dir(cli.data_dir.as_deref());
    config::initialize_data_dir(&data_dir)?;
    let app_config = AppConfig::load_from_path(&config::config_path(&data_dir))?;

    let pipeline = Pipeline::new(data_dir, app_config);

    match cli.command {
        Commands::Preheat => pipeline.preheat().await,
        Commands::Generate(args) => generate(&pipeline, args).await,
    }
}

fn init_logging(verbose: u8, cli_filter: Option<&str>) {
    let filter = select_log_filter(
        verbose,
        std::env::var("RUST_LOG").ok().as_deref(),
        cli_filter,
    );
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|error| {
        eprintln!("Invalid log filter {filter:?} ({error}), falling back to {DEFAULT_LOG_FILTER:?}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
    }
}

async fn generate(pipeline: &Pipeline, args: GenerateArgs) -> Result<()> {
    let bucket = ResizeBucket::from_str_lossy(&args.resize);

    let telemetry = pipeline.telemetry();
    let poller = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshot = telemetry.snapshot();
            info!(
                progress = format!("{:.1}%", snapshot.progress * 100.0),
                bytes_used = snapshot.bytes_used,
                "generation progress"
            );
        }
    });

    let result = pipeline
        .generate(bucket, args.fp16, &args.input, &args.output)
        .await;
    poller.abort();

    if result.is_ok() {
        let snapshot = pipeline.telemetry().snapshot();
        info!(
            progress = format!("{:.1}%", snapshot.progress * 100.0),
            bytes_used = snapshot.bytes_used,
            "generation finished"
        );
    }

    result
}
