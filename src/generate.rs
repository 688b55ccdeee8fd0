//! Resumable dataset generation driver
//!
//! Walks the manifest artist by artist, asks the inference server for
//! `batch_size` variants of every image that has not been generated yet,
//! stores them next to each other and persists progress after each image.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::manifest::{ImageRecord, Manifest};
use crate::resolution::{adjusted_resolution, DEFAULT_MAX_SIDE};
use crate::sampler::{decode_image, ImageSource, SamplerSettings};

/// Encoding used for generated samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// WebP at the configured quality
    Webp,
    /// JPEG at the configured quality
    Jpeg,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpeg => "jpg",
        }
    }
}

/// Settings for one generation run
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Checkpoint the server should switch to
    pub model_name: String,
    /// Variants requested per source image
    pub batch_size: u32,
    /// Maximum resolution; the pixel budget is `max_resolution^2`
    pub max_resolution: u32,
    pub max_side: u32,
    pub format: OutputFormat,
    pub quality: u8,
    pub settings: SamplerSettings,
    /// Fixed seed for reproducible request seeds
    pub seed: Option<u64>,
}

impl GenerationConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            batch_size: 3,
            max_resolution: 1536,
            max_side: DEFAULT_MAX_SIDE,
            format: OutputFormat::Webp,
            quality: 90,
            settings: SamplerSettings::default(),
            seed: None,
        }
    }

    fn max_area(&self) -> u64 {
        self.max_resolution as u64 * self.max_resolution as u64
    }
}

/// Outcome counters for a generation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub files_written: usize,
}

/// Drives generation for a whole manifest against an [`ImageSource`]
pub struct GenerationDriver<S: ImageSource> {
    source: S,
    config: GenerationConfig,
    rng: StdRng,
}

impl<S: ImageSource> GenerationDriver<S> {
    pub fn new(source: S, config: GenerationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { source, config, rng }
    }

    /// Generate every pending image listed in the manifest at `manifest_path`
    pub async fn run(
        &mut self,
        manifest_path: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
    ) -> Result<GenerationSummary> {
        let manifest_path = manifest_path.as_ref();
        let output_dir = output_dir.as_ref();
        self.config.settings.validate()?;

        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

        let mut manifest = Manifest::load(manifest_path)?;
        let mut summary = GenerationSummary::default();

        info!(
            manifest = %manifest_path.display(),
            artists = manifest.artists.len(),
            images = manifest.image_count(),
            already_generated = manifest.generated_count(),
            "Starting generation"
        );

        let artists: Vec<String> = manifest.artists.keys().cloned().collect();
        for artist in &artists {
            let artist_dir = output_dir.join(artist);
            std::fs::create_dir_all(&artist_dir)
                .with_context(|| format!("Failed to create artist directory: {}", artist_dir.display()))?;

            let total = manifest.artists[artist].len();
            let pending = manifest.pending(artist);
            summary.skipped += total - pending.len();

            let progress = ProgressBar::new(total as u64);
            progress.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")?
                    .progress_chars("#>-"),
            );
            progress.set_message(artist.clone());
            progress.set_position((total - pending.len()) as u64);

            for image_name in pending {
                let record = manifest.artists[artist][&image_name].clone();
                let outcome = self
                    .generate_one(&record, &image_name, &artist_dir)
                    .await
                    .and_then(|written| {
                        manifest.mark_generated(artist, &image_name);
                        manifest.save(manifest_path)?;
                        Ok(written)
                    });

                match outcome {
                    Ok(written) => {
                        summary.generated += 1;
                        summary.files_written += written;
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!(
                            artist = %artist,
                            image = %image_name,
                            error = %format!("{:#}", e),
                            "Failed to generate image"
                        );
                    }
                }
                progress.inc(1);
            }
            progress.finish_and_clear();
        }

        info!(
            generated = summary.generated,
            skipped = summary.skipped,
            failed = summary.failed,
            files = summary.files_written,
            "Generation finished"
        );

        Ok(summary)
    }

    /// Request and save all variants of one image; returns the file count
    async fn generate_one(
        &mut self,
        record: &ImageRecord,
        image_name: &str,
        artist_dir: &Path,
    ) -> Result<usize> {
        let (width, height) = adjusted_resolution(
            record.width,
            record.height,
            self.config.max_area(),
            self.config.max_side,
        );

        let request = self.config.settings.request(
            record.prompt(),
            &self.config.model_name,
            self.config.batch_size,
            width,
            height,
            &mut self.rng,
        );

        let images = self.source.fetch(&request).await?;

        let stem = Path::new(image_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| image_name.to_string());

        for (i, encoded) in images.iter().enumerate() {
            let image = decode_image(encoded)?;
            let path = sample_path(artist_dir, &stem, i, self.config.format);
            save_image(&image, &path, self.config.format, self.config.quality)?;
        }

        Ok(images.len())
    }
}

/// `<dir>/<stem>_DPO<n>.<ext>` with a 1-based variant number
pub fn sample_path(dir: &Path, stem: &str, index: usize, format: OutputFormat) -> PathBuf {
    dir.join(format!("{}_DPO{}.{}", stem, index + 1, format.extension()))
}

fn save_image(image: &DynamicImage, path: &Path, format: OutputFormat, quality: u8) -> Result<()> {
    let rgb = image.to_rgb8();
    match format {
        OutputFormat::Webp => {
            let encoded = webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height())
                .encode_simple(false, f32::from(quality))
                .map_err(|e| anyhow::anyhow!("Failed to encode {}: {:?}", path.display(), e))?;
            std::fs::write(path, &*encoded)
                .with_context(|| format!("Failed to save {}", path.display()))
        }
        OutputFormat::Jpeg => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut writer, quality)
                .encode_image(&rgb)
                .with_context(|| format!("Failed to encode {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::Txt2ImgRequest;
    use async_trait::async_trait;
    use base64::Engine as _;
    use std::sync::Mutex;

    /// Returns `count` tiny PNGs per request, or fails for prompts containing "boom"
    struct FakeSource {
        count: usize,
        requests: Mutex<Vec<Txt2ImgRequest>>,
    }

    impl FakeSource {
        fn new(count: usize) -> Self {
            Self { count, requests: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ImageSource for FakeSource {
        async fn fetch(&self, request: &Txt2ImgRequest) -> Result<Vec<String>> {
            self.requests.lock().unwrap().push(request.clone());
            if request.prompt.contains("boom") {
                anyhow::bail!("server error");
            }
            let img = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 100, 50]));
            let mut png = std::io::Cursor::new(Vec::new());
            img.write_to(&mut png, image::ImageFormat::Png)?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(png.into_inner());
            Ok(vec![encoded; self.count])
        }
    }

    fn write_manifest(dir: &Path) -> PathBuf {
        let path = dir.join("dataset.json");
        std::fs::write(
            &path,
            r#"{
  "alice": {
    "a1.png": {"tag": "1girl ||| smile", "width": 3000, "height": 2000},
    "a2.png": {"tag": "done", "width": 512, "height": 512, "generated": true}
  },
  "bob": {
    "b1.jpg": {"tag": "boom", "width": 512, "height": 512},
    "b2.jpg": {"tag": "tree", "width": 777, "height": 555}
  }
}"#,
        )
        .unwrap();
        path
    }

    fn config() -> GenerationConfig {
        let mut config = GenerationConfig::new("test-model");
        config.batch_size = 2;
        config.seed = Some(42);
        config
    }

    #[tokio::test]
    async fn test_run_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = write_manifest(dir.path());
        let out = dir.path().join("out");

        let mut driver = GenerationDriver::new(FakeSource::new(2), config());
        let summary = driver.run(manifest_path.clone(), out.clone()).await.unwrap();

        assert_eq!(
            summary,
            GenerationSummary { generated: 2, skipped: 1, failed: 1, files_written: 4 }
        );
        assert!(out.join("alice/a1_DPO1.webp").exists());
        assert!(out.join("alice/a1_DPO2.webp").exists());
        assert!(out.join("bob/b2_DPO2.webp").exists());
        assert!(!out.join("alice/a2_DPO1.webp").exists());

        let manifest = Manifest::load(&manifest_path).unwrap();
        assert!(manifest.record("alice", "a1.png").unwrap().generated);
        assert!(!manifest.record("bob", "b1.jpg").unwrap().generated);
        assert!(manifest.record("bob", "b2.jpg").unwrap().generated);

        let requests = driver.source.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].prompt, "1girl  smile");
        assert_eq!(requests[0].batch_size, 2);
        assert!(requests[0].width % 8 == 0 && requests[0].height % 8 == 0);
        assert!(requests[0].width as u64 * requests[0].height as u64 <= 1536 * 1536);
    }

    #[tokio::test]
    async fn test_rerun_never_reprocesses_generated() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = write_manifest(dir.path());
        let out = dir.path().join("out");

        let mut first = GenerationDriver::new(FakeSource::new(1), config());
        first.run(manifest_path.clone(), out.clone()).await.unwrap();

        let mut second = GenerationDriver::new(FakeSource::new(1), config());
        let summary = second.run(manifest_path.clone(), out.clone()).await.unwrap();

        // Only the failing entry is retried
        assert_eq!(summary.generated, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.failed, 1);
        let requests = second.source.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "boom");
    }

    #[tokio::test]
    async fn test_jpeg_output() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = write_manifest(dir.path());
        let out = dir.path().join("out");

        let mut config = config();
        config.format = OutputFormat::Jpeg;
        let mut driver = GenerationDriver::new(FakeSource::new(1), config);
        driver.run(&manifest_path, out.as_path()).await.unwrap();

        let path = out.join("bob/b2_DPO1.jpg");
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    #[test]
    fn test_webp_quality_changes_size() {
        let dir = tempfile::tempdir().unwrap();
        let textured = image::RgbImage::from_fn(128, 128, |x, y| {
            let v = (x * 31 + y * 17 + (x ^ y) * 7) as u8;
            image::Rgb([v, v.wrapping_mul(3), v.wrapping_add((x * y) as u8)])
        });
        let image = DynamicImage::ImageRgb8(textured);

        let low = dir.path().join("low.webp");
        let high = dir.path().join("high.webp");
        save_image(&image, &low, OutputFormat::Webp, 10).unwrap();
        save_image(&image, &high, OutputFormat::Webp, 90).unwrap();

        let low_size = std::fs::metadata(&low).unwrap().len();
        let high_size = std::fs::metadata(&high).unwrap().len();
        assert!(low_size < high_size, "q10 {low_size} bytes, q90 {high_size} bytes");

        let decoded = image::open(&high).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 128));
    }

    #[tokio::test]
    async fn test_run_accepts_mixed_path_types() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = write_manifest(dir.path());
        let out = dir.path().join("out");

        let mut driver = GenerationDriver::new(FakeSource::new(1), config());
        let summary = driver
            .run(&manifest_path, out.to_string_lossy().into_owned())
            .await
            .unwrap();
        assert_eq!(summary.generated, 2);
    }

    #[test]
    fn test_sample_path() {
        let path = sample_path(Path::new("out/alice"), "001", 0, OutputFormat::Webp);
        assert_eq!(path, PathBuf::from("out/alice/001_DPO1.webp"));
    }
}
