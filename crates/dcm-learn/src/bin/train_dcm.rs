//! Deep clustering training CLI.
//!
//! Trains the model on synthetic clips and optionally writes per-actor
//! predictions as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=dcm_learn=debug cargo run --release -p dcm-learn --bin train-dcm -- \
//!   --config configs/collective.json \
//!   --epochs 20 --clips 64 --batch-size 8 \
//!   --predictions out/predictions.jsonl
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::Device;
use dcm_core::{DcmConfig, DcmError, ImageSize};
use dcm_learn::{write_jsonl, BatchSource, DeepClusteringModel, SlotFilter, SyntheticClips};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args);

    if let Err(e) = run(&cli) {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &CliConfig) -> Result<(), DcmError> {
    let mut config = match &cli.config {
        Some(path) => DcmConfig::from_json_file(path)?,
        None => smoke_config(),
    };
    if let Some(epochs) = cli.epochs {
        config.epochs = epochs;
    }
    config.validate()?;

    let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
    info!(?device, dataset = %config.dataset, epochs = config.epochs, "starting training");

    let mut clips = SyntheticClips::new(&config, cli.clips, cli.capacity, cli.clip_len, cli.batch_size);
    let mut model = DeepClusteringModel::new(config, clips.n_clips(), clips.capacity(), &device)?;

    let start = Instant::now();
    let report = model.fit(&mut clips)?;
    let elapsed = start.elapsed().as_secs_f32();
    if let Some(last) = report.last() {
        info!(
            steps = report.steps_completed,
            frame = last.frame_reconstruction,
            flow = last.flow_reconstruction,
            cluster = ?last.cluster,
            secs = elapsed,
            "training complete"
        );
    }

    let batches = clips.epoch_batches(model.epoch(), &device)?;
    if let Some(first) = batches.first() {
        let metrics = model.validate_batch(first)?;
        info!(frame_mse = metrics.frame_mse, flow_mse = metrics.flow_mse, "reconstruction");
    }

    if let Some(path) = &cli.predictions {
        let mut records = Vec::new();
        for batch in &batches {
            records.extend(model.predict(batch, SlotFilter::ValidOnly)?);
        }
        let file = File::create(path).map_err(|e| DcmError::Io {
            message: format!("{}: {e}", path.display()),
        })?;
        write_jsonl(&records, BufWriter::new(file))?;
        info!(records = records.len(), path = %path.display(), "predictions written");
    }
    Ok(())
}

/// Small enough to train on a CPU in seconds.
fn smoke_config() -> DcmConfig {
    let mut config = DcmConfig {
        epochs: 6,
        update_interval: 2,
        clustering_start_epoch: 2,
        image: ImageSize {
            width: 32,
            height: 24,
        },
        ..DcmConfig::default()
    };
    config.autoencoder.latent_channels = 16;
    config.autoencoder.hidden_channels = 4;
    config.clustering.n_clusters = 4;
    config.clustering.embed_dim = 32;
    config
}

struct CliConfig {
    config: Option<PathBuf>,
    epochs: Option<usize>,
    clips: usize,
    capacity: usize,
    clip_len: usize,
    batch_size: usize,
    predictions: Option<PathBuf>,
}

fn parse_usize(args: &[String], i: usize, flag: &str) -> usize {
    args.get(i).and_then(|v| v.parse().ok()).unwrap_or_else(|| {
        eprintln!("ERROR: invalid {flag} value");
        std::process::exit(1);
    })
}

fn parse_path(args: &[String], i: usize, flag: &str) -> PathBuf {
    args.get(i).map(PathBuf::from).unwrap_or_else(|| {
        eprintln!("ERROR: missing {flag} value");
        std::process::exit(1);
    })
}

fn parse_args(args: &[String]) -> CliConfig {
    let mut config = CliConfig {
        config: None,
        epochs: None,
        clips: 32,
        capacity: 6,
        clip_len: 4,
        batch_size: 8,
        predictions: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config.config = Some(parse_path(args, i, "--config"));
            }
            "--epochs" => {
                i += 1;
                config.epochs = Some(parse_usize(args, i, "--epochs"));
            }
            "--clips" => {
                i += 1;
                config.clips = parse_usize(args, i, "--clips");
            }
            "--capacity" => {
                i += 1;
                config.capacity = parse_usize(args, i, "--capacity");
            }
            "--clip-len" => {
                i += 1;
                config.clip_len = parse_usize(args, i, "--clip-len");
            }
            "--batch-size" => {
                i += 1;
                config.batch_size = parse_usize(args, i, "--batch-size");
            }
            "--predictions" => {
                i += 1;
                config.predictions = Some(parse_path(args, i, "--predictions"));
            }
            "--help" | "-h" => {
                eprintln!("Usage: train-dcm [options]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config PATH       JSON model config (default: built-in smoke config)");
                eprintln!("  --epochs N          Override the configured epoch count");
                eprintln!("  --clips N           Synthetic clips (default: 32)");
                eprintln!("  --capacity N        Actor slots per clip (default: 6)");
                eprintln!("  --clip-len N        Frames per clip (default: 4)");
                eprintln!("  --batch-size N      Clips per batch (default: 8)");
                eprintln!("  --predictions PATH  Write per-actor predictions as JSON lines");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Use --help for usage information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}
