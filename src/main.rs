//! CLI entry point for the preference-tuning toolkit

use anyhow::Result;
use clap::{Parser, Subcommand};
use mapo_toolkit::cleanup::{delete_marker_files, DEFAULT_MARKER};
use mapo_toolkit::config::TrainingConfig;
use mapo_toolkit::download::{ModelDownloader, ModelPaths, DEFAULT_REPO};
use mapo_toolkit::generate::{GenerationConfig, GenerationDriver, OutputFormat};
use mapo_toolkit::merge::merge_shards;
use mapo_toolkit::pipeline::ValidationPipeline;
use mapo_toolkit::sampler::{SamplerClient, SamplerSettings};
use mapo_toolkit::validation::{log_validation, DirectoryTracker, ValidationPrompts, ValidationStage};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mapo")]
#[command(author = "rzem-ai")]
#[command(version = "0.1.0")]
#[command(about = "Preference dataset and fine-tuning toolkit for SDXL", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete leftover marker files below a directory
    Clean {
        /// Directory to walk
        root: PathBuf,

        /// File name to delete
        #[arg(long, default_value = DEFAULT_MARKER)]
        marker: String,
    },

    /// Generate preference samples for every pending manifest entry
    ///
    /// Progress is written back to the manifest after each image, so an
    /// interrupted run resumes where it stopped.
    Generate {
        /// Checkpoint the inference server should use
        #[arg(long)]
        model_name: String,

        /// Manifest: artist -> image -> {tag, width, height, generated}
        #[arg(long)]
        json_path: PathBuf,

        #[arg(long, default_value = "temp")]
        output_dir: PathBuf,

        /// Variants per source image
        #[arg(long, default_value = "3")]
        batch_size: u32,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value = "7860")]
        port: u16,

        /// Maximum resolution; requests stay within max*max pixels
        #[arg(long, default_value = "1536")]
        max: u32,

        #[arg(long, value_enum, default_value = "webp")]
        format: OutputFormat,

        /// Lossy WebP/JPEG quality
        #[arg(long, default_value = "90")]
        quality: u8,

        /// JSON file overriding sampler settings
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Seed for reproducible request seeds
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Merge a sharded safetensors checkpoint into one file
    Merge {
        /// `*.safetensors.index.json`
        #[arg(long)]
        index: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Shard location (defaults to the index's directory)
        #[arg(long)]
        shard_dir: Option<PathBuf>,
    },

    /// Download the SDXL base model components
    ///
    /// Uses the HF_TOKEN environment variable when set.
    Download {
        #[arg(long, default_value = DEFAULT_REPO)]
        repo: String,
    },

    /// Generate and log validation images
    Validate {
        /// Training config JSON
        #[arg(long)]
        config: PathBuf,

        /// `{"VALIDATION_PROMPTS": [...]}`
        #[arg(long)]
        prompts: PathBuf,

        /// Step the images are logged under
        #[arg(long, default_value = "0")]
        epoch: u64,

        /// Final validation: trained result, then the base model
        #[arg(long = "final")]
        is_final: bool,

        /// Current UNet weights (required unless --final)
        #[arg(long)]
        unet: Option<PathBuf>,

        /// Tracker directory (defaults to <output_dir>/validation_logs)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Force CPU even when a GPU is available
        #[arg(long)]
        cpu: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Clean { root, marker } => {
            let report = delete_marker_files(&root, &marker);
            info!(
                deleted = report.deleted.len(),
                failed = report.failed,
                "✓ Cleanup finished"
            );
        }

        Commands::Generate {
            model_name,
            json_path,
            output_dir,
            batch_size,
            host,
            port,
            max,
            format,
            quality,
            settings,
            seed,
        } => {
            let mut config = GenerationConfig::new(model_name);
            config.batch_size = batch_size;
            config.max_resolution = max;
            config.format = format;
            config.quality = quality;
            config.seed = seed;
            if let Some(path) = settings {
                config.settings = SamplerSettings::load(path)?;
            }

            let client = SamplerClient::new(&host, port);
            info!(url = %client.url(), "Using inference server");

            let mut driver = GenerationDriver::new(client, config);
            let summary = driver.run(&json_path, &output_dir).await?;
            info!(
                generated = summary.generated,
                skipped = summary.skipped,
                failed = summary.failed,
                "✓ Dataset generation done"
            );
        }

        Commands::Merge {
            index,
            output,
            shard_dir,
        } => {
            merge_shards(&index, shard_dir.as_deref(), &output)?;
        }

        Commands::Download { repo } => {
            let downloader = ModelDownloader::new(repo)?;
            let paths = downloader.download_all().await?;

            info!(tokenizer = %paths.tokenizer.display(), "Model locations");
            info!(text_encoder = %paths.text_encoder.display());
            info!(text_encoder_2 = %paths.text_encoder_2.display());
            info!(unet = %paths.unet.display());
            info!(vae = %paths.vae.display());
        }

        Commands::Validate {
            config,
            prompts,
            epoch,
            is_final,
            unet,
            log_dir,
            cpu,
        } => {
            let config = TrainingConfig::load(&config)?;
            let prompts = ValidationPrompts::load(&prompts)?;

            let stage = match (is_final, unet) {
                (true, _) => ValidationStage::Final,
                (false, Some(unet)) => ValidationStage::Intermediate { unet },
                (false, None) => anyhow::bail!("--unet is required for intermediate validation"),
            };

            let paths = resolve_model_paths(&config.pretrained_model_name_or_path).await?;

            let device = if cpu {
                candle_core::Device::Cpu
            } else {
                candle_core::Device::cuda_if_available(0)?
            };
            info!(device = ?device, "Using device");

            let mut pipeline = ValidationPipeline::new(
                &paths,
                stage.initial_unet(),
                config.preprocess.resolution as usize,
                device,
                config.weight_dtype(),
            )?;

            let log_dir = log_dir.unwrap_or_else(|| config.output_dir.join("validation_logs"));
            let mut tracker = DirectoryTracker::new(log_dir);

            let keys = log_validation(
                &mut pipeline,
                &mut tracker,
                &config,
                &prompts.prompts,
                &paths.unet,
                &stage,
                epoch,
            )?;
            info!(keys = ?keys, "✓ Validation logged");
        }
    }

    Ok(())
}

/// Local diffusers directory, or a hub repo id fetched into the cache
async fn resolve_model_paths(model: &str) -> Result<ModelPaths> {
    let path = Path::new(model);
    if path.is_dir() {
        return ModelPaths::from_dir(path);
    }
    ModelDownloader::new(model)?.download_all().await
}
