//! SDXL text encoders and long-prompt embedding
//!
//! SDXL conditions on two CLIP text encoders:
//! - CLIP ViT-L (`text_encoder`, `CLIPTextModel`): penultimate hidden states
//! - OpenCLIP bigG (`text_encoder_2`, `CLIPTextModelWithProjection`):
//!   penultimate hidden states plus the projected pooled embedding
//!
//! Long captions arrive as several 77-token windows (see [`crate::tokenize`]);
//! their hidden states are stitched back into one sequence here.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Encoder layer whose output conditions the UNet (counted from the end)
const PENULTIMATE_LAYER: isize = -2;

/// Architecture of a text encoder, as named in its `config.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoderKind {
    /// `CLIPTextModel`
    Clip,
    /// `CLIPTextModelWithProjection`
    ClipWithProjection,
}

/// The subset of a transformers CLIP text config this crate relies on
#[derive(Debug, Clone, Deserialize)]
pub struct TextEncoderConfig {
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub projection_dim: Option<usize>,
}

fn default_max_position_embeddings() -> usize {
    77
}

impl TextEncoderConfig {
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join("config.json");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read text encoder config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse text encoder config: {}", path.display()))
    }

    pub fn kind(&self) -> Result<TextEncoderKind> {
        let architecture = self
            .architectures
            .first()
            .ok_or_else(|| anyhow::anyhow!("Text encoder config lists no architectures"))?;
        TextEncoderKind::from_architecture(architecture)
    }
}

impl TextEncoderKind {
    pub fn from_architecture(name: &str) -> Result<Self> {
        match name {
            "CLIPTextModel" => Ok(Self::Clip),
            "CLIPTextModelWithProjection" => Ok(Self::ClipWithProjection),
            other => anyhow::bail!("{} is not supported.", other),
        }
    }

    /// Detect the architecture of the encoder stored in `dir`
    pub fn from_config<P: AsRef<Path>>(dir: P) -> Result<Self> {
        TextEncoderConfig::load(dir)?.kind()
    }

    /// SDXL preset for this architecture and its expected (width, depth)
    fn preset(&self) -> (clip::Config, usize, usize) {
        match self {
            Self::Clip => (clip::Config::sdxl(), 768, 12),
            Self::ClipWithProjection => (clip::Config::sdxl2(), 1280, 32),
        }
    }
}

/// A loaded CLIP text encoder
pub struct TextEncoder {
    kind: TextEncoderKind,
    model: clip::ClipTextTransformer,
    projection: Option<candle_nn::Linear>,
    max_position_embeddings: usize,
    device: Device,
}

impl TextEncoder {
    /// Load an encoder from a diffusers `text_encoder*/` directory
    pub fn load<P: AsRef<Path>>(dir: P, device: &Device, dtype: DType) -> Result<Self> {
        let dir = dir.as_ref();
        let config = TextEncoderConfig::load(dir)?;
        let kind = config.kind()?;
        let (preset, hidden_size, layers) = kind.preset();

        if config.hidden_size != hidden_size || config.num_hidden_layers != layers {
            anyhow::bail!(
                "{:?} encoder in {} has hidden_size {} / {} layers, expected {} / {}",
                kind,
                dir.display(),
                config.hidden_size,
                config.num_hidden_layers,
                hidden_size,
                layers
            );
        }

        let weights = find_weights(dir)?;
        info!(path = %weights.display(), kind = ?kind, "Loading text encoder");

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], dtype, device)? };
        let model = clip::ClipTextTransformer::new(vb.clone(), &preset)?;

        let projection = match kind {
            TextEncoderKind::Clip => None,
            TextEncoderKind::ClipWithProjection => {
                let projection_dim = config.projection_dim.unwrap_or(hidden_size);
                Some(candle_nn::linear_no_bias(
                    hidden_size,
                    projection_dim,
                    vb.pp("text_projection"),
                )?)
            }
        };

        info!("✓ Text encoder loaded successfully");

        Ok(Self {
            kind,
            model,
            projection,
            max_position_embeddings: config.max_position_embeddings,
            device: device.clone(),
        })
    }

    pub fn kind(&self) -> TextEncoderKind {
        self.kind
    }

    pub fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run the encoder on `[n, 77]` ids
    ///
    /// Returns the penultimate hidden states `[n, 77, hidden]` and, for the
    /// projection variant, the projected pooled embedding `[n, proj]`.
    pub fn forward(&self, input_ids: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let (last, penultimate) =
            self.model
                .forward_until_encoder_layer(input_ids, usize::MAX, PENULTIMATE_LAYER)?;

        let pooled = match &self.projection {
            Some(projection) => {
                let positions = eos_positions(input_ids)?;
                let rows = positions
                    .iter()
                    .enumerate()
                    .map(|(row, &pos)| last.i((row, pos)))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                let pooled = Tensor::stack(&rows, 0)?;
                Some(projection.forward(&pooled)?)
            }
            None => None,
        };

        Ok((penultimate, pooled))
    }
}

fn find_weights(dir: &Path) -> Result<PathBuf> {
    ["model.safetensors", "model.fp16.safetensors"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| anyhow::anyhow!("No text encoder weights found in {}", dir.display()))
}

/// Position of the first highest id per row (EOS has the largest id in CLIP vocabularies)
fn eos_positions(input_ids: &Tensor) -> Result<Vec<usize>> {
    let rows: Vec<Vec<u32>> = input_ids.to_device(&Device::Cpu)?.to_dtype(DType::U32)?.to_vec2()?;
    Ok(rows
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0usize, 0u32), |(best, max), (i, &id)| {
                    if id > max {
                        (i, id)
                    } else {
                        (best, max)
                    }
                })
                .0
        })
        .collect())
}

/// Re-join per-window hidden states `[b, chunks * p, d]` into one sequence
///
/// Keeps the very first token (BOS), the `p - 2` content tokens of every
/// window starting at `1, 1 + p, ...` below `max_length`, and the very last
/// token.
pub fn stitch_chunks(hidden_states: &Tensor, window: usize, max_length: usize) -> Result<Tensor> {
    let seq_len = hidden_states.dim(1)?;
    let mut parts = vec![hidden_states.narrow(1, 0, 1)?];

    let mut j = 1;
    while j < max_length && j < seq_len {
        let len = (window - 2).min(seq_len - j);
        parts.push(hidden_states.narrow(1, j, len)?);
        j += window;
    }

    parts.push(hidden_states.narrow(1, seq_len - 1, 1)?);
    Ok(Tensor::cat(&parts, 1)?)
}

/// Keep one pooled row per example (the first window of each)
pub fn first_chunk_rows(pooled: &Tensor, batch_size: usize) -> Result<Tensor> {
    let rows = pooled.dim(0)?;
    if batch_size == 0 || rows % batch_size != 0 {
        anyhow::bail!("{} pooled rows cannot be split into {} examples", rows, batch_size);
    }
    let n_chunks = rows / batch_size;
    let indices: Vec<u32> = (0..batch_size).map(|k| (k * n_chunks) as u32).collect();
    let indices = Tensor::new(indices.as_slice(), pooled.device())?;
    Ok(pooled.index_select(&indices, 0)?)
}

/// Encode tokenized prompts with all text encoders
///
/// `input_ids[i]` holds the ids for `encoders[i]`, shaped `[b, chunks, 77]`
/// (or `[b, 77]`). Returns `(prompt_embeds [b, seq, sum(hidden)], pooled
/// [b, proj])`, the pooled embedding coming from the last encoder.
pub fn encode_prompt(
    encoders: &[TextEncoder],
    input_ids: &[Tensor],
    max_length: Option<usize>,
) -> Result<(Tensor, Tensor)> {
    if encoders.len() != input_ids.len() || encoders.is_empty() {
        anyhow::bail!(
            "Got {} encoders for {} id tensors",
            encoders.len(),
            input_ids.len()
        );
    }

    let mut prompt_embeds_list = Vec::with_capacity(encoders.len());
    let mut pooled_prompt_embeds = None;
    let last_index = encoders.len() - 1;

    for (i, encoder) in encoders.iter().enumerate() {
        let ids = &input_ids[i];
        let b_size = ids.dim(0)?;
        let window = encoder.max_position_embeddings();
        let ids = ids.reshape(((), window))?.to_device(encoder.device())?;

        let (hidden_states, pooled) = encoder.forward(&ids)?;
        let hidden_size = hidden_states.dim(D::Minus1)?;
        let mut hidden_states = hidden_states.reshape((b_size, (), hidden_size))?;

        if let Some(max_length) = max_length {
            hidden_states = stitch_chunks(&hidden_states, window, max_length)?;
        }

        if i == last_index {
            let pooled = pooled.ok_or_else(|| {
                anyhow::anyhow!("Last text encoder must be {:?}", TextEncoderKind::ClipWithProjection)
            })?;
            pooled_prompt_embeds = Some(first_chunk_rows(&pooled, b_size)?);
        }

        debug!(encoder = i, shape = ?hidden_states.dims(), "Encoded prompt");
        prompt_embeds_list.push(hidden_states);
    }

    let prompt_embeds = Tensor::cat(&prompt_embeds_list, D::Minus1)?;
    let pooled = pooled_prompt_embeds
        .ok_or_else(|| anyhow::anyhow!("No pooled embedding produced"))?;

    Ok((prompt_embeds, pooled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_architecture() {
        assert_eq!(
            TextEncoderKind::from_architecture("CLIPTextModel").unwrap(),
            TextEncoderKind::Clip
        );
        assert_eq!(
            TextEncoderKind::from_architecture("CLIPTextModelWithProjection").unwrap(),
            TextEncoderKind::ClipWithProjection
        );
        let err = TextEncoderKind::from_architecture("T5EncoderModel").unwrap_err();
        assert_eq!(err.to_string(), "T5EncoderModel is not supported.");
    }

    #[test]
    fn test_kind_from_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"architectures": ["CLIPTextModelWithProjection"], "hidden_size": 1280,
                "num_hidden_layers": 32, "projection_dim": 1280}"#,
        )
        .unwrap();
        assert_eq!(
            TextEncoderKind::from_config(dir.path()).unwrap(),
            TextEncoderKind::ClipWithProjection
        );

        // Missing keys are fatal
        std::fs::write(dir.path().join("config.json"), r#"{"architectures": ["CLIPTextModel"]}"#)
            .unwrap();
        assert!(TextEncoderKind::from_config(dir.path()).is_err());
    }

    #[test]
    fn test_load_rejects_mismatched_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"architectures": ["CLIPTextModel"], "hidden_size": 512, "num_hidden_layers": 12}"#,
        )
        .unwrap();
        let result = TextEncoder::load(dir.path(), &Device::Cpu, DType::F32);
        assert!(result.is_err());
    }

    #[test]
    fn test_stitch_chunks() {
        // b=1, three windows of 5 tokens, hidden size 1; value = position
        let values: Vec<f32> = (0..15).map(|v| v as f32).collect();
        let hidden = Tensor::from_vec(values, (1, 15, 1), &Device::Cpu).unwrap();

        let stitched = stitch_chunks(&hidden, 5, 13).unwrap();
        let flat: Vec<f32> = stitched.flatten_all().unwrap().to_vec1().unwrap();
        // BOS, windows [1..4), [6..9), [11..14), last
        assert_eq!(flat, vec![0., 1., 2., 3., 6., 7., 8., 11., 12., 13., 14.]);
    }

    #[test]
    fn test_stitch_single_window() {
        let values: Vec<f32> = (0..5).map(|v| v as f32).collect();
        let hidden = Tensor::from_vec(values, (1, 5, 1), &Device::Cpu).unwrap();
        let stitched = stitch_chunks(&hidden, 5, 5).unwrap();
        let flat: Vec<f32> = stitched.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![0., 1., 2., 3., 4.]);
    }

    #[test]
    fn test_first_chunk_rows() {
        let pooled = Tensor::arange(0f32, 6f32, &Device::Cpu)
            .unwrap()
            .reshape((6, 1))
            .unwrap();
        let rows = first_chunk_rows(&pooled, 2).unwrap();
        let flat: Vec<f32> = rows.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![0., 3.]);
        assert!(first_chunk_rows(&pooled, 4).is_err());
    }

    #[test]
    fn test_eos_positions() {
        let ids = Tensor::new(&[[49406u32, 5, 49407, 49407], [49406, 49407, 0, 0]], &Device::Cpu).unwrap();
        assert_eq!(eos_positions(&ids).unwrap(), vec![2, 1]);
    }
}
