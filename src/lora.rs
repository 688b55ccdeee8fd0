//! LoRA (Low-Rank Adaptation) weight loading and fusion
//!
//! A LoRA adapter stores a low-rank update per layer that is merged into the
//! base weight: W' = W + (alpha/rank) * strength * (B @ A)
//!
//! Two key layouts are understood:
//! - diffusers/PEFT: `unet.<module path>.lora_A.weight` / `.lora_B.weight`
//! - kohya: `lora_unet_<module_path_with_underscores>.lora_down.weight` /
//!   `.lora_up.weight`, with an optional `.alpha` scalar

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default file name diffusers uses when saving UNet LoRA weights
pub const LORA_WEIGHTS_NAME: &str = "pytorch_lora_weights.safetensors";

/// Individual LoRA weight pair for a single layer
#[derive(Debug)]
pub struct LoraWeight {
    /// Normalized layer name (e.g. "mid_block.attentions.0.proj_in")
    pub layer_name: String,
    /// Down projection (A) - `[rank, in_features]` or `[rank, in, kh, kw]`
    pub lora_down: Tensor,
    /// Up projection (B) - `[out_features, rank]` or `[out, rank, 1, 1]`
    pub lora_up: Tensor,
    /// Alpha scaling factor (defaults to rank if not specified)
    pub alpha: f32,
    pub rank: usize,
}

impl LoraWeight {
    /// `(alpha / rank) * strength * (B @ A)` reshaped to `shape`
    pub fn delta(&self, shape: &[usize], strength: f32) -> Result<Tensor> {
        let up = self.lora_up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = self.lora_down.to_dtype(DType::F32)?.flatten_from(1)?;
        let scale = (self.alpha / self.rank as f32) * strength;

        let delta = up.matmul(&down)?.affine(scale as f64, 0.0)?;
        if delta.elem_count() != shape.iter().product::<usize>() {
            anyhow::bail!(
                "LoRA update for {} has shape {:?}, cannot apply to {:?}",
                self.layer_name,
                delta.dims(),
                shape
            );
        }
        Ok(delta.reshape(shape)?)
    }
}

/// LoRA adapter containing all weights for a fine-tuned model
#[derive(Debug)]
pub struct LoraAdapter {
    pub name: String,
    /// All weight pairs keyed by normalized layer name
    pub weights: HashMap<String, LoraWeight>,
}

impl LoraAdapter {
    /// Load a LoRA adapter from a safetensors file
    pub fn load<P: AsRef<Path>>(
        path: P,
        name: String,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading LoRA adapter");

        let file_data = std::fs::read(path)
            .with_context(|| format!("Failed to read LoRA file: {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&file_data)
            .with_context(|| format!("Failed to parse safetensors: {}", path.display()))?;

        let mut alpha_values: HashMap<String, f32> = HashMap::new();
        let mut down_tensors: HashMap<String, Tensor> = HashMap::new();
        let mut up_tensors: HashMap<String, Tensor> = HashMap::new();

        for (key, _) in tensors.tensors() {
            if let Some(base_name) = key.strip_suffix(".alpha") {
                let alpha = load_tensor_from_safetensors(&tensors, &key, &Device::Cpu, DType::F32)?
                    .flatten_all()?
                    .get(0)?
                    .to_scalar::<f32>()?;
                alpha_values.insert(normalize_lora_key(base_name), alpha);
            } else if let Some((base_name, is_down)) = split_lora_key(&key) {
                let tensor = load_tensor_from_safetensors(&tensors, &key, device, dtype)?;
                let normalized = normalize_lora_key(base_name);
                if is_down {
                    down_tensors.insert(normalized, tensor);
                } else {
                    up_tensors.insert(normalized, tensor);
                }
            } else {
                debug!(key = %key, "Ignoring non-LoRA tensor");
            }
        }

        let mut weights = HashMap::new();
        for (layer_name, lora_down) in down_tensors {
            let Some(lora_up) = up_tensors.remove(&layer_name) else {
                warn!(layer = %layer_name, "LoRA down tensor without matching up tensor");
                continue;
            };

            let rank = lora_down.dims()[0];
            let alpha = alpha_values.get(&layer_name).copied().unwrap_or(rank as f32);
            debug!(layer = %layer_name, rank, alpha, "Loaded LoRA weight pair");

            weights.insert(
                layer_name.clone(),
                LoraWeight {
                    layer_name,
                    lora_down,
                    lora_up,
                    alpha,
                    rank,
                },
            );
        }

        for layer_name in up_tensors.keys() {
            warn!(layer = %layer_name, "LoRA up tensor without matching down tensor");
        }

        info!(
            path = %path.display(),
            weight_pairs = weights.len(),
            "✓ LoRA adapter loaded"
        );

        Ok(Arc::new(Self { name, weights }))
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FuseReport {
    pub fused: usize,
    pub unmatched: Vec<String>,
}

/// Merge every adapter layer into the matching `<module>.weight` of `base`
///
/// Layers are matched by their dotted module path, or for kohya names by the
/// module path with dots replaced by underscores. Fused weights keep the base
/// tensor's dtype.
pub fn fuse_lora_into(
    base: &mut HashMap<String, Tensor>,
    adapter: &LoraAdapter,
    strength: f32,
) -> Result<FuseReport> {
    let underscored: HashMap<String, String> = base
        .keys()
        .filter_map(|key| key.strip_suffix(".weight"))
        .map(|module| (module.replace('.', "_"), format!("{}.weight", module)))
        .collect();

    let mut report = FuseReport::default();
    for (layer_name, weight) in &adapter.weights {
        let dotted = format!("{}.weight", layer_name);
        let key = if base.contains_key(&dotted) {
            Some(dotted)
        } else {
            underscored.get(layer_name).cloned()
        };

        let Some(key) = key else {
            warn!(layer = %layer_name, "LoRA layer has no matching base weight");
            report.unmatched.push(layer_name.clone());
            continue;
        };

        let original = &base[&key];
        let delta = weight.delta(original.dims(), strength)?;
        let fused = (original.to_dtype(DType::F32)? + delta.to_device(original.device())?)?
            .to_dtype(original.dtype())?;
        base.insert(key, fused);
        report.fused += 1;
    }

    report.unmatched.sort();
    info!(
        adapter = %adapter.name,
        fused = report.fused,
        unmatched = report.unmatched.len(),
        strength,
        "✓ LoRA fused into base weights"
    );
    Ok(report)
}

/// Load a tensor from safetensors and convert to target dtype
fn load_tensor_from_safetensors(
    tensors: &SafeTensors,
    key: &str,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let view = tensors
        .tensor(key)
        .with_context(|| format!("Tensor not found: {}", key))?;

    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(floats, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let halfs: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let bhalfs: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(bhalfs, shape.as_slice(), device)?
        }
        other => anyhow::bail!("Unsupported tensor dtype for {}: {:?}", key, other),
    };

    if tensor.dtype() != dtype {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor)
    }
}

/// Split `<base>.lora_{down,up,A,B}[.<adapter>].weight` into `(base, is_down)`
fn split_lora_key(key: &str) -> Option<(&str, bool)> {
    let key = key.strip_suffix(".weight")?;
    for (marker, is_down) in [
        (".lora_down", true),
        (".lora_A", true),
        (".lora_up", false),
        (".lora_B", false),
    ] {
        if let Some(pos) = key.rfind(marker) {
            return Some((&key[..pos], is_down));
        }
    }
    None
}

/// Strip wrapper prefixes so names line up with UNet module paths
///
/// `unet.mid_block.proj_in` -> `mid_block.proj_in`,
/// `lora_unet_mid_block_proj_in` -> `mid_block_proj_in`
pub fn normalize_lora_key(key: &str) -> String {
    let mut normalized = key;
    for prefix in ["base_model.model.", "unet.", "lora_unet_"] {
        if let Some(rest) = normalized.strip_prefix(prefix) {
            normalized = rest;
        }
    }
    normalized.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(values.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_normalize_lora_key() {
        assert_eq!(
            normalize_lora_key("unet.down_blocks.1.attentions.0.proj_in"),
            "down_blocks.1.attentions.0.proj_in"
        );
        assert_eq!(
            normalize_lora_key("base_model.model.mid_block.attentions.0.proj_out"),
            "mid_block.attentions.0.proj_out"
        );
        assert_eq!(
            normalize_lora_key("lora_unet_mid_block_attentions_0_proj_out"),
            "mid_block_attentions_0_proj_out"
        );
        assert_eq!(normalize_lora_key("conv_in"), "conv_in");
    }

    #[test]
    fn test_split_lora_key() {
        assert_eq!(
            split_lora_key("lora_unet_mid_block_proj_in.lora_down.weight"),
            Some(("lora_unet_mid_block_proj_in", true))
        );
        assert_eq!(split_lora_key("some_layer.lora_up.weight"), Some(("some_layer", false)));
        assert_eq!(split_lora_key("layer.lora_A.weight"), Some(("layer", true)));
        assert_eq!(split_lora_key("layer.lora_B.default.weight"), Some(("layer", false)));
        assert_eq!(split_lora_key("layer.alpha"), None);
        assert_eq!(split_lora_key("conv_in.weight"), None);
    }

    #[test]
    fn test_load_and_fuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LORA_WEIGHTS_NAME);

        let mut lora = HashMap::new();
        // PEFT pair on a linear layer, rank 1, alpha defaults to rank
        lora.insert("unet.mid_block.proj_in.lora_A.weight".to_string(), tensor(&[1.0, 2.0], &[1, 2]));
        lora.insert("unet.mid_block.proj_in.lora_B.weight".to_string(), tensor(&[1.0, -1.0], &[2, 1]));
        // kohya pair on a 1x1 conv, rank 2, alpha 1
        lora.insert(
            "lora_unet_conv_out.lora_down.weight".to_string(),
            tensor(&[1.0, 0.0, 0.0, 1.0], &[2, 2, 1, 1]),
        );
        lora.insert(
            "lora_unet_conv_out.lora_up.weight".to_string(),
            tensor(&[2.0, 2.0, 4.0, 4.0], &[2, 2, 1, 1]),
        );
        lora.insert("lora_unet_conv_out.alpha".to_string(), tensor(&[1.0], &[]));
        // Layer absent from the base
        lora.insert("unet.missing.lora_A.weight".to_string(), tensor(&[1.0], &[1, 1]));
        lora.insert("unet.missing.lora_B.weight".to_string(), tensor(&[1.0], &[1, 1]));
        candle_core::safetensors::save(&lora, &path).unwrap();

        let adapter = LoraAdapter::load(&path, "test".to_string(), &Device::Cpu, DType::F32).unwrap();
        assert_eq!(adapter.weight_count(), 3);
        assert_eq!(adapter.weights["conv_out"].alpha, 1.0);
        assert_eq!(adapter.weights["mid_block.proj_in"].rank, 1);

        let mut base = HashMap::new();
        base.insert("mid_block.proj_in.weight".to_string(), Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap());
        base.insert(
            "conv_out.weight".to_string(),
            Tensor::ones((2, 2, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        );

        let report = fuse_lora_into(&mut base, &adapter, 0.5).unwrap();
        assert_eq!(report.fused, 2);
        assert_eq!(report.unmatched, vec!["missing".to_string()]);

        // 0.5 * [[1], [-1]] @ [[1, 2]]
        let linear: Vec<Vec<f32>> = base["mid_block.proj_in.weight"].to_vec2().unwrap();
        assert_eq!(linear, vec![vec![0.5, 1.0], vec![-0.5, -1.0]]);

        // 1 + (1/2) * 0.5 * up @ I
        let conv: Vec<f32> = base["conv_out.weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(conv, vec![1.5, 1.5, 2.0, 2.0]);
    }

    #[test]
    fn test_fuse_keeps_base_dtype() {
        let weight = LoraWeight {
            layer_name: "proj".to_string(),
            lora_down: tensor(&[1.0], &[1, 1]),
            lora_up: tensor(&[2.0], &[1, 1]),
            alpha: 1.0,
            rank: 1,
        };
        let adapter = LoraAdapter {
            name: "dtype".to_string(),
            weights: HashMap::from([("proj".to_string(), weight)]),
        };
        let mut base = HashMap::from([(
            "proj.weight".to_string(),
            Tensor::ones((1, 1), DType::F16, &Device::Cpu).unwrap(),
        )]);

        fuse_lora_into(&mut base, &adapter, 1.0).unwrap();
        let fused = &base["proj.weight"];
        assert_eq!(fused.dtype(), DType::F16);
        let value = fused.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(value, vec![3.0]);
    }

    #[test]
    fn test_delta_shape_mismatch() {
        let weight = LoraWeight {
            layer_name: "proj".to_string(),
            lora_down: tensor(&[1.0, 1.0], &[1, 2]),
            lora_up: tensor(&[1.0], &[1, 1]),
            alpha: 1.0,
            rank: 1,
        };
        assert!(weight.delta(&[3, 3], 1.0).is_err());
    }
}
