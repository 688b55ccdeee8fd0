//! Client for a local txt2img inference server
//!
//! Requests follow the `/sdapi/v1/txt2img` JSON schema: prompt, sampling
//! parameters and resolution go in, base64-encoded images come back.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::debug;

const TXT2IMG_ROUTE: &str = "/sdapi/v1/txt2img";

const DEFAULT_NEGATIVE_PROMPT: &str = "lowres,(bad),extra digits,2girls,bad hands,error,text,fewer,extra,missing,worst quality,jpeg artifacts,(low, old, early,mid)";

/// Sampling parameters shared by every request of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub negative_prompt: String,
    pub sampler_name: String,
    pub scheduler: String,
    pub steps: u32,
    pub cfg_scale: f32,
    /// Inclusive range seeds are drawn from
    pub seed_range: (u64, u64),
    /// Enable the tiled VAE extension on the server
    pub tiled_vae: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            sampler_name: "DPM++ 2M".to_string(),
            scheduler: "Karras".to_string(),
            steps: 28,
            cfg_scale: 4.0,
            seed_range: (1, 1_000_000),
            tiled_vae: true,
        }
    }
}

impl SamplerSettings {
    /// Load settings from a JSON file; absent fields keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sampler settings: {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse sampler settings: {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that cannot produce a request
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.seed_range;
        if lo > hi {
            anyhow::bail!("seed_range start {} is greater than end {}", lo, hi);
        }
        Ok(())
    }

    /// Build a request for one source image
    pub fn request<R: Rng + ?Sized>(
        &self,
        prompt: String,
        model_name: &str,
        batch_size: u32,
        width: u32,
        height: u32,
        rng: &mut R,
    ) -> Txt2ImgRequest {
        let (lo, hi) = self.seed_range;
        let alwayson_scripts = if self.tiled_vae {
            json!({
                "tiled vae": {
                    "args": ["true", 1024, 128, "false", "true", "true", "true"],
                },
            })
        } else {
            json!({})
        };

        Txt2ImgRequest {
            prompt,
            negative_prompt: self.negative_prompt.clone(),
            seed: rng.gen_range(lo..=hi),
            sampler_name: self.sampler_name.clone(),
            scheduler: self.scheduler.clone(),
            batch_size,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            width,
            height,
            send_images: true,
            save_images: false,
            override_settings: OverrideSettings {
                sd_model_checkpoint: model_name.to_string(),
            },
            alwayson_scripts,
        }
    }
}

/// Body of a txt2img request
#[derive(Debug, Clone, Serialize)]
pub struct Txt2ImgRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub sampler_name: String,
    pub scheduler: String,
    pub batch_size: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub send_images: bool,
    pub save_images: bool,
    pub override_settings: OverrideSettings,
    pub alwayson_scripts: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideSettings {
    pub sd_model_checkpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct Txt2ImgResponse {
    #[serde(default)]
    pub images: Vec<String>,
}

/// Anything that can turn a txt2img request into base64 images
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, request: &Txt2ImgRequest) -> Result<Vec<String>>;
}

/// HTTP client for the inference server
pub struct SamplerClient {
    client: reqwest::Client,
    url: String,
}

impl SamplerClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("http://{}:{}{}", host, port, TXT2IMG_ROUTE),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ImageSource for SamplerClient {
    async fn fetch(&self, request: &Txt2ImgRequest) -> Result<Vec<String>> {
        debug!(
            url = %self.url,
            width = request.width,
            height = request.height,
            seed = request.seed,
            "Requesting images"
        );

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", self.url))?;

        let body: Txt2ImgResponse = response
            .json()
            .await
            .context("Failed to parse txt2img response")?;

        Ok(body.images)
    }
}

/// Decode one base64 image returned by the server
pub fn decode_image(encoded: &str) -> Result<image::DynamicImage> {
    // Some servers prefix the payload with a data URL header
    let payload = encoded
        .split_once("base64,")
        .map(|(_, data)| data)
        .unwrap_or(encoded);

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .context("Invalid base64 image payload")?;
    image::load_from_memory(&bytes).context("Failed to decode generated image")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_request_body_shape() {
        let settings = SamplerSettings::default();
        let mut rng = StdRng::seed_from_u64(7);
        let request = settings.request("1girl, solo".to_string(), "model-v1", 3, 832, 1216, &mut rng);

        assert!((1..=1_000_000).contains(&request.seed));

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["prompt"], "1girl, solo");
        assert_eq!(body["sampler_name"], "DPM++ 2M");
        assert_eq!(body["scheduler"], "Karras");
        assert_eq!(body["batch_size"], 3);
        assert_eq!(body["steps"], 28);
        assert_eq!(body["cfg_scale"], 4.0);
        assert_eq!(body["width"], 832);
        assert_eq!(body["height"], 1216);
        assert_eq!(body["send_images"], true);
        assert_eq!(body["save_images"], false);
        assert_eq!(body["override_settings"]["sd_model_checkpoint"], "model-v1");
        assert_eq!(body["alwayson_scripts"]["tiled vae"]["args"][1], 1024);
    }

    #[test]
    fn test_settings_partial_override() {
        let settings: SamplerSettings =
            serde_json::from_str(r#"{"steps": 20, "tiled_vae": false}"#).unwrap();
        assert_eq!(settings.steps, 20);
        assert_eq!(settings.sampler_name, "DPM++ 2M");

        let mut rng = StdRng::seed_from_u64(1);
        let request = settings.request(String::new(), "m", 1, 64, 64, &mut rng);
        assert_eq!(request.alwayson_scripts, json!({}));
    }

    #[test]
    fn test_settings_reject_inverted_seed_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"seed_range": [10, 1]}"#).unwrap();
        let err = SamplerSettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("seed_range"));

        std::fs::write(&path, r#"{"seed_range": [7, 7]}"#).unwrap();
        let settings = SamplerSettings::load(&path).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let request = settings.request(String::new(), "m", 1, 64, 64, &mut rng);
        assert_eq!(request.seed, 7);
    }

    #[test]
    fn test_response_without_images() {
        let response: Txt2ImgResponse = serde_json::from_str(r#"{"info": "{}"}"#).unwrap();
        assert!(response.images.is_empty());
    }

    #[test]
    fn test_decode_image() {
        let img = image::RgbImage::from_pixel(4, 2, image::Rgb([10, 20, 30]));
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(png.into_inner());

        let decoded = decode_image(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 2));

        let with_header = format!("data:image/png;base64,{}", encoded);
        assert!(decode_image(&with_header).is_ok());
        assert!(decode_image("not base64!").is_err());
    }

    #[test]
    fn test_client_url() {
        let client = SamplerClient::new("localhost", 7860);
        assert_eq!(client.url(), "http://localhost:7860/sdapi/v1/txt2img");
    }
}
