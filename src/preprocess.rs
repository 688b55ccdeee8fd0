//! Adaptive preprocessing of preference pairs
//!
//! Every record carries two encoded images of the same prompt plus a label
//! saying whether the first one is preferred. Images keep their aspect ratio:
//! each pair is resized to an area budget of `resolution²`, aligned to
//! `divisible`, and both images share one crop window and one flip decision
//! so they stay pixel-aligned.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::resolution::adaptive_size;
use crate::tokenize::{tokenize_captions, CaptionTokenizer};

/// Image preprocessing knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Side of the square whose area bounds every resized image
    pub resolution: u32,
    /// Output height and width are multiples of this
    pub divisible: u32,
    /// Probability of flipping a pair's preference label
    pub label_noise_prob: Option<f64>,
    pub random_crop: bool,
    pub no_hflip: bool,
    /// Decode/resize worker threads, 0 for one per core
    pub workers: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            resolution: 1024,
            divisible: 64,
            label_noise_prob: None,
            random_crop: false,
            no_hflip: false,
            workers: 0,
        }
    }
}

impl PreprocessConfig {
    pub fn target_area(&self) -> u64 {
        u64::from(self.resolution) * u64::from(self.resolution)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution == 0 {
            anyhow::bail!("resolution must be positive");
        }
        if self.divisible == 0 {
            anyhow::bail!("divisible must be positive");
        }
        if let Some(p) = self.label_noise_prob {
            if !(0.0..=1.0).contains(&p) {
                anyhow::bail!("label_noise_prob must be within [0, 1], got {}", p);
            }
        }
        Ok(())
    }
}

/// One row of the preference dataset
#[derive(Debug, Clone)]
pub struct PreferenceRecord {
    pub jpg_0: Vec<u8>,
    pub jpg_1: Vec<u8>,
    /// 1.0 when `jpg_0` is preferred, 0.0 when `jpg_1` is
    pub label_0: f32,
    pub caption: String,
}

/// A preprocessed pair, preferred image first
#[derive(Debug, Clone)]
pub struct TrainingExample {
    /// `[6, h, w]` f32 in `[-1, 1]`: chosen RGB then rejected RGB
    pub pixel_values: Tensor,
    /// `(height, width)` of the preferred source image before resizing
    pub original_size: (u32, u32),
    /// `(top, left)` of the crop window
    pub crop_top_left: (u32, u32),
    /// `[chunks, 77]` u32
    pub input_ids_one: Tensor,
    pub input_ids_two: Tensor,
}

/// A stacked mini-batch of examples
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// `[batch, 6, h, w]` f32
    pub pixel_values: Tensor,
    pub input_ids_one: Tensor,
    pub input_ids_two: Tensor,
    pub original_sizes: Vec<(u32, u32)>,
    pub crop_top_lefts: Vec<(u32, u32)>,
}

pub struct Preprocessor {
    config: PreprocessConfig,
    tokenizers: [CaptionTokenizer; 2],
    pool: rayon::ThreadPool,
}

impl Preprocessor {
    pub fn new(
        config: PreprocessConfig,
        tokenizer_one: CaptionTokenizer,
        tokenizer_two: CaptionTokenizer,
    ) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("preprocess-{}", i))
            .build()
            .context("Failed to build preprocessing thread pool")?;

        Ok(Self {
            config,
            tokenizers: [tokenizer_one, tokenizer_two],
            pool,
        })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Turn a batch of records into training examples
    ///
    /// Decoding and resizing run on the worker pool; augmentation draws from
    /// `rng` sequentially in record order so results are reproducible for a
    /// seeded generator.
    pub fn preprocess<R: Rng + ?Sized>(
        &self,
        records: &[PreferenceRecord],
        rng: &mut R,
    ) -> Result<Vec<TrainingExample>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let target_area = self.config.target_area();
        let divisible = self.config.divisible;

        let pairs: Vec<(RgbImage, RgbImage, (u32, u32))> = self.pool.install(|| {
            records
                .par_iter()
                .enumerate()
                .map(|(i, record)| {
                    let first = decode_rgb(&record.jpg_0)
                        .with_context(|| format!("Failed to decode jpg_0 of record {}", i))?;
                    let second = decode_rgb(&record.jpg_1)
                        .with_context(|| format!("Failed to decode jpg_1 of record {}", i))?;
                    let original_size = (first.height(), first.width());

                    let second = if second.dimensions() != first.dimensions() {
                        imageops::resize(&second, first.width(), first.height(), FilterType::CatmullRom)
                    } else {
                        second
                    };

                    let (h, w) = adaptive_size(original_size.0, original_size.1, target_area, divisible);
                    Ok((shrink_to(first, h, w), shrink_to(second, h, w), original_size))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut prepared = Vec::with_capacity(records.len());
        for (record, (first, second, original_size)) in records.iter().zip(pairs) {
            let mut label = record.label_0;
            if let Some(p) = self.config.label_noise_prob {
                if rng.gen::<f64>() < p {
                    label = 1.0 - label;
                }
            }

            let (chosen, rejected) = if label == 0.0 { (second, first) } else { (first, second) };

            let (target_h, target_w) =
                adaptive_size(original_size.0, original_size.1, target_area, divisible);
            let (top, left) = crop_window(
                (chosen.height(), chosen.width()),
                (target_h, target_w),
                self.config.random_crop,
                rng,
            );
            let mut chosen = imageops::crop_imm(&chosen, left, top, target_w, target_h).to_image();
            let mut rejected = imageops::crop_imm(&rejected, left, top, target_w, target_h).to_image();

            if !self.config.no_hflip && rng.gen::<f64>() < 0.5 {
                chosen = imageops::flip_horizontal(&chosen);
                rejected = imageops::flip_horizontal(&rejected);
            }

            prepared.push((pair_to_tensor(&chosen, &rejected)?, original_size, (top, left)));
        }

        let captions: Vec<String> = records.iter().map(|r| r.caption.clone()).collect();
        let (ids_one, ids_two) =
            tokenize_captions([&self.tokenizers[0], &self.tokenizers[1]], &captions, rng)?;

        let examples = prepared
            .into_iter()
            .enumerate()
            .map(|(i, (pixel_values, original_size, crop_top_left))| {
                Ok(TrainingExample {
                    pixel_values,
                    original_size,
                    crop_top_left,
                    input_ids_one: ids_one.get(i)?,
                    input_ids_two: ids_two.get(i)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(count = examples.len(), "Preference pairs preprocessed");
        Ok(examples)
    }
}

fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Bilinear downscale to `(h, w)` when the image exceeds it in either dimension
fn shrink_to(image: RgbImage, h: u32, w: u32) -> RgbImage {
    if image.height() > h || image.width() > w {
        imageops::resize(&image, w, h, FilterType::Triangle)
    } else {
        image
    }
}

/// `(top, left)` of a `target` window inside an image of `size`, both `(h, w)`
pub fn crop_window<R: Rng + ?Sized>(
    size: (u32, u32),
    target: (u32, u32),
    random: bool,
    rng: &mut R,
) -> (u32, u32) {
    let max_top = size.0.saturating_sub(target.0);
    let max_left = size.1.saturating_sub(target.1);

    if random {
        if max_top == 0 && max_left == 0 {
            return (0, 0);
        }
        (rng.gen_range(0..=max_top), rng.gen_range(0..=max_left))
    } else {
        let center = |slack: u32| (f64::from(slack) / 2.0).round_ties_even() as u32;
        (center(max_top), center(max_left))
    }
}

/// Stack two equally sized images into a normalized `[6, h, w]` tensor
fn pair_to_tensor(chosen: &RgbImage, rejected: &RgbImage) -> Result<Tensor> {
    let (w, h) = chosen.dimensions();
    if rejected.dimensions() != (w, h) {
        anyhow::bail!(
            "Pair images differ in size: {:?} vs {:?}",
            chosen.dimensions(),
            rejected.dimensions()
        );
    }

    let plane = (w * h) as usize;
    let mut data = vec![0f32; 6 * plane];
    for (offset, image) in [(0, chosen), (3, rejected)] {
        for (x, y, pixel) in image.enumerate_pixels() {
            let idx = (y * w + x) as usize;
            for c in 0..3 {
                data[(offset + c) * plane + idx] = (pixel[c] as f32 / 255.0 - 0.5) / 0.5;
            }
        }
    }

    Ok(Tensor::from_vec(data, (6, h as usize, w as usize), &Device::Cpu)?)
}

/// Stack examples into one batch
///
/// All examples must share the same pixel and token shapes.
pub fn collate(examples: &[TrainingExample]) -> Result<TrainingBatch> {
    if examples.is_empty() {
        anyhow::bail!("Cannot collate an empty batch");
    }

    let pixels: Vec<&Tensor> = examples.iter().map(|e| &e.pixel_values).collect();
    let ids_one: Vec<&Tensor> = examples.iter().map(|e| &e.input_ids_one).collect();
    let ids_two: Vec<&Tensor> = examples.iter().map(|e| &e.input_ids_two).collect();

    Ok(TrainingBatch {
        pixel_values: Tensor::stack(&pixels, 0)
            .context("Examples in a batch must share one image size")?
            .to_dtype(DType::F32)?
            .contiguous()?,
        input_ids_one: Tensor::stack(&ids_one, 0)?,
        input_ids_two: Tensor::stack(&ids_two, 0)?,
        original_sizes: examples.iter().map(|e| e.original_size).collect(),
        crop_top_lefts: examples.iter().map(|e| e.crop_top_left).collect(),
    })
}

/// SDXL micro-conditioning: `[1, 6]` of `(orig_h, orig_w, top, left, res, res)`
pub fn compute_time_ids(
    original_size: (u32, u32),
    crop_top_left: (u32, u32),
    resolution: u32,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let ids = [
        original_size.0,
        original_size.1,
        crop_top_left.0,
        crop_top_left.1,
        resolution,
        resolution,
    ]
    .map(|v| v as f32);

    Ok(Tensor::from_vec(ids.to_vec(), (1, 6), device)?.to_dtype(dtype)?)
}
