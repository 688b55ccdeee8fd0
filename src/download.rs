//! Model downloader for HuggingFace Hub
//!
//! Fetches the SDXL components used for caption tokenization and validation
//! image generation:
//! - both CLIP tokenizers (BPE `vocab.json` + `merges.txt`)
//! - both text encoders with their `config.json` (~1.7GB)
//! - UNet (~10GB at full precision)
//! - VAE (~330MB)

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiRepo};
use std::path::{Path, PathBuf};
use tracing::info;

/// Base model the preference fine-tuning starts from
pub const DEFAULT_REPO: &str = "stabilityai/stable-diffusion-xl-base-1.0";

const TOKENIZER_FILES: [&str; 2] = ["vocab.json", "merges.txt"];
const TEXT_ENCODER_FILES: [&str; 2] = ["config.json", "model.safetensors"];
const DIFFUSION_WEIGHTS: &str = "diffusion_pytorch_model.safetensors";

/// Model downloader that caches models using HuggingFace Hub
pub struct ModelDownloader {
    api: Api,
    repo_id: String,
}

impl ModelDownloader {
    /// Uses the HF_TOKEN environment variable if set
    pub fn new(repo_id: impl Into<String>) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API client")?;
        Ok(Self {
            api,
            repo_id: repo_id.into(),
        })
    }

    fn repo(&self) -> ApiRepo {
        self.api.repo(hf_hub::Repo::model(self.repo_id.clone()))
    }

    /// Download every component, returning their cached locations
    pub async fn download_all(&self) -> Result<ModelPaths> {
        info!(repo = %self.repo_id, "Downloading SDXL components");

        let (tokenizer, tokenizer_2, text_encoder, text_encoder_2, unet, vae) = tokio::try_join!(
            self.download_folder("tokenizer", &TOKENIZER_FILES),
            self.download_folder("tokenizer_2", &TOKENIZER_FILES),
            self.download_folder("text_encoder", &TEXT_ENCODER_FILES),
            self.download_folder("text_encoder_2", &TEXT_ENCODER_FILES),
            self.download_file("unet", DIFFUSION_WEIGHTS),
            self.download_file("vae", DIFFUSION_WEIGHTS),
        )?;

        info!("✓ All models downloaded successfully!");

        Ok(ModelPaths {
            tokenizer,
            tokenizer_2,
            text_encoder,
            text_encoder_2,
            unet,
            vae,
        })
    }

    /// Download `files` of one component folder, returning the local folder
    async fn download_folder(&self, folder: &str, files: &[&str]) -> Result<PathBuf> {
        let repo = self.repo();
        let mut local_dir = None;

        for file in files {
            let path = repo
                .get(&format!("{}/{}", folder, file))
                .await
                .with_context(|| format!("Failed to download {}/{}", folder, file))?;
            local_dir = path.parent().map(Path::to_path_buf);
        }

        let dir = local_dir
            .ok_or_else(|| anyhow::anyhow!("Could not determine local directory of {}", folder))?;
        info!("  ✓ {} downloaded: {}", folder, dir.display());
        Ok(dir)
    }

    async fn download_file(&self, folder: &str, file: &str) -> Result<PathBuf> {
        let path = self
            .repo()
            .get(&format!("{}/{}", folder, file))
            .await
            .with_context(|| format!("Failed to download {}/{}", folder, file))?;

        info!("  ✓ {} downloaded: {}", folder, path.display());
        Ok(path)
    }
}

/// Locations of the SDXL components on disk
#[derive(Debug, Clone)]
pub struct ModelPaths {
    /// Directories holding `vocab.json` + `merges.txt`
    pub tokenizer: PathBuf,
    pub tokenizer_2: PathBuf,
    /// Directories holding `config.json` + `model.safetensors`
    pub text_encoder: PathBuf,
    pub text_encoder_2: PathBuf,
    /// Weight files
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl ModelPaths {
    /// Components of a local diffusers-layout model directory
    pub fn from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let paths = Self {
            tokenizer: root.join("tokenizer"),
            tokenizer_2: root.join("tokenizer_2"),
            text_encoder: root.join("text_encoder"),
            text_encoder_2: root.join("text_encoder_2"),
            unet: root.join("unet").join(DIFFUSION_WEIGHTS),
            vae: root.join("vae").join(DIFFUSION_WEIGHTS),
        };

        for path in [
            &paths.tokenizer,
            &paths.tokenizer_2,
            &paths.text_encoder,
            &paths.text_encoder_2,
            &paths.unet,
            &paths.vae,
        ] {
            if !path.exists() {
                anyhow::bail!("Model component missing: {}", path.display());
            }
        }

        Ok(paths)
    }
}
