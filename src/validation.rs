//! Validation image logging
//!
//! Generates one image per validation prompt and hands them to a [`Tracker`].
//! During training the current UNet is used. The final run loads the trained
//! result (LoRA fused into the base UNet, or a fully trained UNet) and then
//! regenerates every prompt with the untouched base UNet for comparison.

use anyhow::{Context, Result};
use candle_core::Device;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::TrainingConfig;
use crate::lora::{fuse_lora_into, LoraAdapter, LORA_WEIGHTS_NAME};
use crate::pipeline::{SamplingOptions, ValidationPipeline};

/// Full UNet checkpoint written by full (non-LoRA) training
pub const UNET_WEIGHTS_NAME: &str = "diffusion_pytorch_model.safetensors";
/// Base UNet with the trained LoRA merged in
pub const FUSED_UNET_NAME: &str = "unet_lora_fused.safetensors";

pub const VALIDATION_KEY: &str = "validation";
pub const TEST_KEY: &str = "test";
pub const TEST_WITHOUT_LORA_KEY: &str = "test_without_lora";
pub const TEST_WITHOUT_ALIGNED_UNET_KEY: &str = "test_without_aligned_unet";

/// `{"VALIDATION_PROMPTS": [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationPrompts {
    #[serde(rename = "VALIDATION_PROMPTS")]
    pub prompts: Vec<String>,
}

impl ValidationPrompts {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read validation prompts: {}", path.display()))?;
        let prompts: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse validation prompts: {}", path.display()))?;
        if prompts.prompts.is_empty() {
            anyhow::bail!("No validation prompts in {}", path.display());
        }
        Ok(prompts)
    }
}

/// One generated image with its caption
#[derive(Debug, Clone)]
pub struct LoggedImage {
    pub png: Vec<u8>,
    pub caption: String,
}

/// Destination for logged validation images
pub trait Tracker {
    fn name(&self) -> &str;

    fn log_images(&mut self, key: &str, step: u64, images: &[LoggedImage]) -> Result<()>;
}

/// Writes `<root>/<key>/<step>/<i>.png` plus a `captions.json` per step
pub struct DirectoryTracker {
    root: PathBuf,
}

impl DirectoryTracker {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn step_dir(&self, key: &str, step: u64) -> PathBuf {
        self.root.join(key).join(step.to_string())
    }
}

impl Tracker for DirectoryTracker {
    fn name(&self) -> &str {
        "directory"
    }

    fn log_images(&mut self, key: &str, step: u64, images: &[LoggedImage]) -> Result<()> {
        let dir = self.step_dir(key, step);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for (i, image) in images.iter().enumerate() {
            let path = dir.join(format!("{}.png", i));
            std::fs::write(&path, &image.png)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        let captions: Vec<&str> = images.iter().map(|image| image.caption.as_str()).collect();
        std::fs::write(dir.join("captions.json"), serde_json::to_string_pretty(&captions)?)?;

        info!(key, step, count = images.len(), dir = %dir.display(), "Logged validation images");
        Ok(())
    }
}

/// Something that turns prompts into PNG images with a swappable UNet
pub trait ImageGenerator {
    fn load_unet(&mut self, weights: &Path) -> Result<()>;

    fn generate(&self, prompt: &str, options: &SamplingOptions) -> Result<Vec<u8>>;
}

impl ImageGenerator for ValidationPipeline {
    fn load_unet(&mut self, weights: &Path) -> Result<()> {
        self.replace_unet(weights)
    }

    fn generate(&self, prompt: &str, options: &SamplingOptions) -> Result<Vec<u8>> {
        ValidationPipeline::generate(self, prompt, options)
    }
}

/// Which UNet a validation run starts from
#[derive(Debug, Clone)]
pub enum ValidationStage {
    /// Mid-training check with the current UNet weights
    Intermediate { unet: PathBuf },
    /// End of training: trained result, then the base UNet
    Final,
}

impl ValidationStage {
    /// UNet the generator should be built with, `None` for the base model
    pub fn initial_unet(&self) -> Option<&Path> {
        match self {
            ValidationStage::Intermediate { unet } => Some(unet.as_path()),
            ValidationStage::Final => None,
        }
    }
}

/// Generate and log images for every prompt
///
/// `base_unet` is the pre-trained UNet the run started from. Returns the
/// tracker keys that were logged, in order.
pub fn log_validation<G: ImageGenerator>(
    generator: &mut G,
    tracker: &mut dyn Tracker,
    config: &TrainingConfig,
    prompts: &[String],
    base_unet: &Path,
    stage: &ValidationStage,
    epoch: u64,
) -> Result<Vec<&'static str>> {
    info!(
        prompts = prompts.len(),
        epoch,
        tracker = tracker.name(),
        "Running validation"
    );

    let seed = config.seed.unwrap_or_else(rand::random);
    let mut logged = Vec::new();

    match stage {
        ValidationStage::Intermediate { unet } => {
            generator.load_unet(unet)?;
            let images = generate_all(generator, prompts, seed)?;
            tracker.log_images(VALIDATION_KEY, epoch, &images)?;
            logged.push(VALIDATION_KEY);
        }
        ValidationStage::Final => {
            let trained = trained_unet(config, base_unet)?;
            generator.load_unet(&trained)?;
            let images = generate_all(generator, prompts, seed)?;
            tracker.log_images(TEST_KEY, epoch, &images)?;
            logged.push(TEST_KEY);

            generator.load_unet(base_unet)?;
            let baseline = generate_all(generator, prompts, seed)?;
            let key = if config.is_lora() {
                TEST_WITHOUT_LORA_KEY
            } else {
                TEST_WITHOUT_ALIGNED_UNET_KEY
            };
            tracker.log_images(key, epoch, &baseline)?;
            logged.push(key);
        }
    }

    Ok(logged)
}

/// Weights file holding the trained UNet of a finished run
///
/// For LoRA runs the adapter in the output directory is fused into the base
/// UNet and written next to it.
pub fn trained_unet(config: &TrainingConfig, base_unet: &Path) -> Result<PathBuf> {
    if !config.is_lora() {
        let path = config.output_dir.join(UNET_WEIGHTS_NAME);
        if !path.exists() {
            anyhow::bail!("Trained UNet not found: {}", path.display());
        }
        return Ok(path);
    }

    let lora_path = config.output_dir.join(LORA_WEIGHTS_NAME);
    let adapter = LoraAdapter::load(&lora_path, LORA_WEIGHTS_NAME.to_string(), &Device::Cpu, config.weight_dtype())?;

    let mut weights = candle_core::safetensors::load(base_unet, &Device::Cpu)
        .with_context(|| format!("Failed to read base UNet: {}", base_unet.display()))?;
    fuse_lora_into(&mut weights, &adapter, 1.0)?;

    let fused_path = config.output_dir.join(FUSED_UNET_NAME);
    candle_core::safetensors::save(&weights, &fused_path)
        .with_context(|| format!("Failed to write fused UNet: {}", fused_path.display()))?;
    info!(path = %fused_path.display(), "✓ Fused UNet saved");

    Ok(fused_path)
}

/// Prompt `i` is sampled with `seed + i`
fn generate_all<G: ImageGenerator>(generator: &G, prompts: &[String], seed: u64) -> Result<Vec<LoggedImage>> {
    prompts
        .iter()
        .enumerate()
        .map(|(i, prompt)| {
            let options = SamplingOptions {
                seed: seed.wrapping_add(i as u64),
                ..SamplingOptions::default()
            };
            Ok(LoggedImage {
                png: generator.generate(prompt, &options)?,
                caption: format!("{}: {}", i, prompt),
            })
        })
        .collect()
}
