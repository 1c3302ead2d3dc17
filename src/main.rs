//! PatchCL SSL CLI
//!
//! Entry point for semi-supervised segmentation training with patch-level
//! contrastive learning on the Burn framework.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use patchcl_ssl::backend::{backend_name, ExecutionContext, TrainingBackend};
use patchcl_ssl::dataset::{read_split_file, ColorMap, PatchAugmentationConfig, SegmentationDataset};
use patchcl_ssl::model::config::{PipelineConfig, StageSchedule};
use patchcl_ssl::training::{PipelineOutcome, SslPipeline};
use patchcl_ssl::utils::format_duration;
use patchcl_ssl::utils::logging::{init_logging, LogConfig};

/// Semi-supervised medical image segmentation with patch contrastive learning
#[derive(Parser, Debug)]
#[command(name = "patchcl_ssl")]
#[command(version)]
#[command(about = "Semi-supervised segmentation with patch contrastive learning and Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Data location flags shared by all subcommands
#[derive(Args, Debug, Clone)]
struct DataArgs {
    /// TOML configuration file; flags given on the command line override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory the split-file paths are resolved against
    #[arg(long = "dataset_path")]
    dataset_path: Option<PathBuf>,

    /// Directory holding `<split>/labeled.txt` and `<split>/unlabeled.txt`
    #[arg(long = "output_dir")]
    output_dir: Option<PathBuf>,

    /// Split sub-directory (default 1-3)
    #[arg(long)]
    split: Option<String>,

    /// Training image side length (default 224)
    #[arg(long = "img_size")]
    img_size: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the k-fold semi-supervised training schedule
    Train {
        #[command(flatten)]
        data: DataArgs,

        /// Patch side length (default 14)
        #[arg(long = "patch_size")]
        patch_size: Option<usize>,

        /// Embedding dimension (default 128)
        #[arg(long = "embedding_size")]
        embedding_size: Option<usize>,

        /// Batch size (default 16)
        #[arg(long = "batch_size")]
        batch_size: Option<usize>,

        /// Contrastive weight of pretraining; 0 selects the dynamic schedule
        #[arg(long = "ContrastiveWeights")]
        contrastive_weights: Option<f64>,

        /// Checkpoint every this many epochs (default 2)
        #[arg(long = "save_interval")]
        save_interval: Option<usize>,

        /// Where checkpoints and loss tables are written (default output)
        #[arg(long = "output_root")]
        output_root: Option<PathBuf>,

        /// Number of folds (default 5)
        #[arg(long)]
        folds: Option<usize>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Train every stage from epoch 0 to this end epoch
        #[arg(long)]
        epochs: Option<usize>,

        /// Embed the teacher's patches without augmentation
        #[arg(long = "no_augmentation", default_value = "false")]
        no_augmentation: bool,

        /// Re-initialise models and optimizer at every fold
        #[arg(long = "reset_between_folds", default_value = "false")]
        reset_between_folds: bool,
    },

    /// Show statistics of the labeled and unlabeled split lists
    Stats {
        #[command(flatten)]
        data: DataArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };

    if let Err(e) = init_logging(&log_config) {
        eprintln!("{} {}", "Warning:".yellow(), e);
    }

    print_banner();

    match cli.command {
        Commands::Train {
            data,
            patch_size,
            embedding_size,
            batch_size,
            contrastive_weights,
            save_interval,
            output_root,
            folds,
            seed,
            epochs,
            no_augmentation,
            reset_between_folds,
        } => {
            let mut config = resolve_config(&data)?;
            if let Some(v) = patch_size {
                config.patch_size = v;
            }
            if let Some(v) = embedding_size {
                config.embedding_size = v;
            }
            if let Some(v) = batch_size {
                config.batch_size = v;
            }
            if let Some(v) = contrastive_weights {
                config.contrastive_weight = v;
            }
            if let Some(v) = save_interval {
                config.save_interval = v;
            }
            if let Some(v) = output_root {
                config.output_root = v;
            }
            if let Some(v) = folds {
                config.folds = v;
            }
            if let Some(v) = seed {
                config.seed = v;
            }
            if let Some(end) = epochs {
                config.epochs = StageSchedule::uniform(end);
            }
            if no_augmentation {
                config.augmentation = PatchAugmentationConfig::none();
            }
            config.reset_between_folds |= reset_between_folds;

            cmd_train(config)?;
        }

        Commands::Stats { data } => {
            let config = resolve_config(&data)?;
            cmd_stats(&config)?;
        }
    }

    Ok(())
}

/// Config file (or defaults) with the data flags applied
fn resolve_config(args: &DataArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_toml(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::default(),
    };
    if let Some(v) = &args.dataset_path {
        config.dataset_path = v.clone();
    }
    if let Some(v) = &args.output_dir {
        config.output_dir = v.clone();
    }
    if let Some(v) = &args.split {
        config.split = v.clone();
    }
    if let Some(v) = args.img_size {
        config.img_size = v;
    }
    Ok(config)
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════════╗
 ║   🩺 PatchCL Semi-Supervised Segmentation                    ║
 ║   Patch contrastive learning + EMA teacher with Burn + Rust  ║
 ╚══════════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn cmd_train(config: PipelineConfig) -> Result<()> {
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  🧠 Backend:           {}", backend_name());
    println!("  📂 Dataset:           {:?}", config.dataset_path);
    println!("  🗂️  Split:             {:?}", config.output_dir.join(&config.split));
    println!("  🖼️  Image / patch:     {} / {}", config.img_size, config.patch_size);
    println!("  📐 Embedding size:    {}", config.embedding_size);
    println!("  📦 Batch size:        {}", config.batch_size);
    println!(
        "  ⚖️  Contrastive weight: {}",
        if config.contrastive_weight == 0.0 {
            "dynamic".to_string()
        } else {
            config.contrastive_weight.to_string()
        }
    );
    println!("  💾 Save interval:     {}", config.save_interval);
    println!("  🔁 Folds:             {}", config.folds);
    println!();

    let started = std::time::Instant::now();
    let ctx = ExecutionContext::<TrainingBackend>::default_training();
    let mut pipeline = SslPipeline::new(config).context("Invalid configuration")?;
    let outcome = pipeline.run(&ctx).context("Training failed")?;

    let elapsed = format_duration(started.elapsed().as_secs_f64());
    match outcome {
        PipelineOutcome::Completed { folds } => {
            info!("Completed {} folds in {}", folds, elapsed);
            println!("  🎉 Completed {} folds in {}", folds, elapsed);
        }
        PipelineOutcome::StoppedEarly { fold, reason } => {
            warn!("Stopped early at fold {}: {}", fold, reason);
            println!(
                "  {} Stopped at fold {} after {}: {}",
                "⚠".yellow(),
                fold,
                elapsed,
                reason
            );
        }
    }

    Ok(())
}

fn cmd_stats(config: &PipelineConfig) -> Result<()> {
    let colormap = ColorMap::kidney();
    for (title, list, labeled) in [
        ("Labeled split", config.labeled_list(), true),
        ("Unlabeled split", config.unlabeled_list(), false),
    ] {
        if !list.exists() {
            println!("{} Split list not found: {:?}", "Error:".red(), list);
            continue;
        }
        let entries = read_split_file(&list, &config.dataset_path, labeled)?;
        let dataset = SegmentationDataset::load(&entries, config.img_size, &colormap)?;
        dataset.stats(config.num_classes).print(title);
        println!();
    }
    Ok(())
}
