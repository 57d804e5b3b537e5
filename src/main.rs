use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use unet_train::training::trainer::RUN_REPORT_JSON;
use unet_train::training::{DataLoader, DataLoaderConfig, TensorDataset};
use unet_train::{DeviceType, RunConfig, UNetTrainer, ValidationMode};

#[derive(Parser)]
#[command(name = "unet-train")]
#[command(about = "Train a U-Net for semantic segmentation", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model
    Train(TrainArgs),

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Training samples (safetensors with `images` and `masks`)
    #[arg(long)]
    train_data: PathBuf,

    /// Validation samples (safetensors with `images` and `masks`)
    #[arg(long)]
    val_data: PathBuf,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to checkpoint (.safetensors) from which to load
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Train only the final layer of the loaded checkpoint
    #[arg(long)]
    freeze: bool,

    /// Do not write checkpoints
    #[arg(long)]
    debug: bool,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Sample loading worker threads
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// cpu, cuda[:n] or metal[:n]
    #[arg(long)]
    device: Option<DeviceType>,

    /// Validate on the whole validation set every epoch
    #[arg(long)]
    full_validation: bool,
}

impl TrainArgs {
    /// Layer the command-line flags over the loaded configuration
    fn apply(&self, config: &mut RunConfig) {
        if self.checkpoint.is_some() {
            config.checkpoint_path = self.checkpoint.clone();
        }
        config.freeze |= self.freeze;
        config.debug |= self.debug;
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = dir.clone();
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if self.full_validation {
            config.validation_mode = ValidationMode::Full;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("unet_train=info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Config { file } => validate_config(file),
        Commands::Info => {
            show_system_info();
            Ok(())
        }
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let mut config = RunConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut config);
    config
        .validate()
        .context("Invalid run configuration")?;

    let device = config.device().context("Failed to open compute device")?;
    info!("Configuration loaded, training on {}", config.device);

    let train_set = TensorDataset::from_safetensors(&args.train_data)
        .context("Failed to load training data")?;
    let val_set = TensorDataset::from_safetensors(&args.val_data)
        .context("Failed to load validation data")?;

    let train_loader = DataLoader::new(
        Arc::new(train_set),
        DataLoaderConfig {
            batch_size: config.batch_size,
            shuffle: true,
            num_workers: config.num_workers,
            drop_last: false,
            seed: config.seed,
        },
        device.clone(),
    )?;
    // Unshuffled so the first batch is the same every epoch
    let val_loader = DataLoader::new(
        Arc::new(val_set),
        DataLoaderConfig {
            batch_size: config.batch_size,
            shuffle: false,
            num_workers: config.num_workers,
            drop_last: false,
            seed: config.seed,
        },
        device,
    )?;

    let mut trainer =
        UNetTrainer::from_config(config, Box::new(train_loader), Box::new(val_loader))
            .context("Failed to initialize trainer")?;

    let report = trainer.run().context("Training failed")?;
    report
        .save_json(&trainer.checkpoint_dir().join(RUN_REPORT_JSON))
        .context("Failed to write run report")?;

    info!(
        "Training complete: {} epochs, {} steps ({} skipped), best loss {:?}, {} checkpoints",
        report.epochs_completed,
        report.global_steps,
        report.skipped_steps,
        report.best_loss,
        report.checkpoints.len()
    );
    info!(
        "Final validation - Loss: {:.4}, Acc: {:.2}%",
        report.final_validation.loss,
        report.final_validation.accuracy * 100.0
    );
    if let Some(path) = &report.metrics_csv {
        info!("Metrics written to {}", path.display());
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = RunConfig::from_file(&config_path)
        .context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!("Configuration summary:");
    info!("  - Image size: {}, classes: {}", config.image_size, config.num_classes);
    info!("  - Encoder features: {:?}", config.features);
    info!(
        "  - Epochs: {}, batch size: {}, learning rate: {}",
        config.num_epochs, config.batch_size, config.learning_rate
    );
    info!("  - Checkpoint: {:?} (freeze: {})", config.checkpoint_path, config.freeze);
    info!("  - Device: {}", config.device);

    Ok(())
}

fn show_system_info() {
    println!("unet-train - U-Net segmentation training");
    println!();
    println!("Version: {}", unet_train::VERSION);
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  ✅ NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  ❌ CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  ✅ Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  ❌ Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  ✅ Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  ❌ Accelerate support (not compiled)");

    println!("  ✅ CPU");
    println!();
    println!("Usage:");
    println!("  unet-train train --train-data train.safetensors --val-data val.safetensors");
    println!("  unet-train train ... --checkpoint unet-epoch12.safetensors --freeze");
    println!("  unet-train config -f run.toml   # Validate configuration");
    println!("  unet-train info                 # Show this information");
}
