//! Training-side settings loaded from JSON

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::loss::PreferenceLossConfig;
use crate::preprocess::PreprocessConfig;
use crate::tokenize::DEFAULT_MAX_LENGTH;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixedPrecision {
    #[default]
    No,
    Fp16,
    Bf16,
}

impl MixedPrecision {
    /// Weight dtype for frozen models
    pub fn dtype(&self) -> DType {
        match self {
            Self::No => DType::F32,
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

/// Settings shared by preprocessing, the loss and validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Local diffusers directory or hub repo id of the base model
    pub pretrained_model_name_or_path: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
    /// LoRA training when set, full UNet training otherwise
    #[serde(default)]
    pub lora_rank: Option<usize>,
    #[serde(default)]
    pub mixed_precision: MixedPrecision,
    /// Token budget for long captions
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(flatten)]
    pub preprocess: PreprocessConfig,
    #[serde(flatten)]
    pub loss: PreferenceLossConfig,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("mapo-output")
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

impl TrainingConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read training config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse training config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.preprocess.validate()?;
        if self.max_length < 77 {
            anyhow::bail!("max_length must be at least 77, got {}", self.max_length);
        }
        if self.loss.num_train_timesteps == 0 {
            anyhow::bail!("num_train_timesteps must be positive");
        }
        if self.lora_rank == Some(0) {
            anyhow::bail!("lora_rank must be positive when set");
        }
        Ok(())
    }

    pub fn weight_dtype(&self) -> DType {
        self.mixed_precision.dtype()
    }

    pub fn is_lora(&self) -> bool {
        self.lora_rank.is_some()
    }
}
