//! SDXL generation pipeline for validation images
//!
//! This module orchestrates the image generation workflow:
//! 1. Encode prompt and empty prompt (both CLIP encoders)
//! 2. Denoise with the UNet under classifier-free guidance
//! 3. VAE decode to RGB
//! 4. Encode as PNG

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::download::ModelPaths;
use crate::models::{encode_prompt, TextEncoder};
use crate::tokenize::{CaptionTokenizer, TokenizerSpec};

/// Latent scaling factor of the SDXL VAE
const VAE_SCALE: f64 = 0.13025;

/// Sampling parameters of one validation image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            steps: 35,
            guidance_scale: 5.0,
            seed: 0,
        }
    }
}

/// Complete SDXL generation pipeline
pub struct ValidationPipeline {
    config: StableDiffusionConfig,
    tokenizers: [CaptionTokenizer; 2],
    encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    unet_path: PathBuf,
    vae: AutoEncoderKL,
    device: Device,
    dtype: DType,
}

impl ValidationPipeline {
    /// Load all components; `unet_weights` overrides the base UNet when given
    pub fn new(
        paths: &ModelPaths,
        unet_weights: Option<&Path>,
        resolution: usize,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        info!(resolution, dtype = ?dtype, "Initializing SDXL validation pipeline");

        let config = StableDiffusionConfig::sdxl(None, Some(resolution), Some(resolution));

        let tokenizers = [
            CaptionTokenizer::load(&paths.tokenizer, TokenizerSpec::clip_l(), 77)?,
            CaptionTokenizer::load(&paths.tokenizer_2, TokenizerSpec::clip_g(), 77)?,
        ];
        let encoders = vec![
            TextEncoder::load(&paths.text_encoder, &device, dtype)?,
            TextEncoder::load(&paths.text_encoder_2, &device, dtype)?,
        ];

        let unet_path = unet_weights.unwrap_or(paths.unet.as_path()).to_path_buf();
        let unet = load_unet(&config, &unet_path, &device, dtype)?;

        // The SDXL VAE overflows in f16
        let vae = config
            .build_vae(&paths.vae, &device, DType::F32)
            .with_context(|| format!("Failed to load VAE: {}", paths.vae.display()))?;

        info!("✓ Pipeline initialized successfully");

        Ok(Self {
            config,
            tokenizers,
            encoders,
            unet,
            unet_path,
            vae,
            device,
            dtype,
        })
    }

    /// Swap in another UNet checkpoint, keeping encoders and VAE
    pub fn replace_unet(&mut self, unet_weights: &Path) -> Result<()> {
        if unet_weights == self.unet_path {
            return Ok(());
        }
        self.unet = load_unet(&self.config, unet_weights, &self.device, self.dtype)?;
        self.unet_path = unet_weights.to_path_buf();
        Ok(())
    }

    pub fn unet_path(&self) -> &Path {
        &self.unet_path
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// `[1, 77, 2048]` prompt embedding
    fn embed(&self, prompt: &str) -> Result<Tensor> {
        let ids = self
            .tokenizers
            .iter()
            .map(|tokenizer| {
                let ids = tokenizer.encode(prompt)?;
                Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let (embeds, _pooled) = encode_prompt(&self.encoders, &ids, None)?;
        Ok(embeds)
    }

    /// Generate one image and return it PNG-encoded
    pub fn generate(&self, prompt: &str, options: &SamplingOptions) -> Result<Vec<u8>> {
        let (width, height) = (self.config.width, self.config.height);
        info!(
            prompt_preview = %prompt.chars().take(50).collect::<String>(),
            steps = options.steps,
            size = format!("{}x{}", width, height),
            seed = options.seed,
            "Starting generation"
        );

        let cond = self.embed(prompt)?;
        let uncond = self.embed("")?;
        let embeddings = Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?;
        debug!(shape = ?embeddings.dims(), "Text embeddings");

        let mut scheduler = self.config.build_scheduler(options.steps)?;

        if let Err(e) = self.device.set_seed(options.seed) {
            debug!(error = %e, "Could not set device seed (CPU backend)");
        }
        let mut latents = (Tensor::randn(0f32, 1f32, (1, 4, height / 8, width / 8), &self.device)?
            * scheduler.init_noise_sigma())?
        .to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        let total_steps = timesteps.len();
        for (i, &t) in timesteps.iter().enumerate() {
            let latent_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_input = scheduler.scale_model_input(latent_input, t)?;

            let noise_pred = self.unet.forward(&latent_input, t as f64, &embeddings)?;
            let noise_pred = guide(&noise_pred, options.guidance_scale)?;

            latents = scheduler.step(&noise_pred, t, &latents)?;

            if (i + 1) % 5 == 0 || i + 1 == total_steps {
                debug!(step = i + 1, total = total_steps, "Denoising progress");
            }
        }

        let latents = (latents.to_dtype(DType::F32)? / VAE_SCALE)?;
        let image = self.vae.decode(&latents)?;

        let (rgb, w, h) = tensor_to_rgb(&image)?;
        let png_data = encode_png(&rgb, w, h)?;
        info!(size_kb = png_data.len() / 1024, "✓ Generation complete!");

        Ok(png_data)
    }
}

fn load_unet(
    config: &StableDiffusionConfig,
    weights: &Path,
    device: &Device,
    dtype: DType,
) -> Result<UNet2DConditionModel> {
    info!(path = %weights.display(), "Loading UNet");
    config
        .build_unet(weights, device, 4, false, dtype)
        .with_context(|| format!("Failed to load UNet: {}", weights.display()))
}

/// Classifier-free guidance over a `[uncond; cond]` batch
fn guide(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, cond) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((cond - uncond)? * guidance_scale)?)?)
}

/// `[1, 3, h, w]` in `[-1, 1]` to interleaved RGB bytes plus `(width, height)`
pub fn tensor_to_rgb(image: &Tensor) -> Result<(Vec<u8>, u32, u32)> {
    let image = image.squeeze(0)?;
    let (_channels, height, width) = image.dims3()?;

    let bytes = ((image.to_dtype(DType::F32)? / 2.0)? + 0.5)?
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_device(&Device::Cpu)?
        .to_vec1::<u8>()?;

    Ok((bytes, width as u32, height as u32))
}

/// Encode RGB data as PNG
pub fn encode_png(rgb_data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    use image::{ImageBuffer, RgbImage};
    use std::io::Cursor;

    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb_data.to_vec())
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;

    let mut png_data = Cursor::new(Vec::new());
    img.write_to(&mut png_data, image::ImageFormat::Png)?;

    Ok(png_data.into_inner())
}
