//! Preference-tuning toolkit for SDXL
//!
//! Builds preference datasets against a local txt2img server and provides the
//! pieces a margin-aware preference fine-tuning loop calls into.
//!
//! ## Features
//!
//! - **Dataset generation**: resumable, manifest-driven batch generation
//! - **Weight merging**: sharded safetensors checkpoints into one file
//! - **Preprocessing**: aspect-preserving resize of preference pairs with
//!   shared crop/flip and long-caption tokenization
//! - **Loss**: margin-aware preference objective on candle tensors
//! - **Validation**: SDXL sampling with the trained UNet or LoRA, logged
//!   through a tracker
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mapo_toolkit::generate::{GenerationConfig, GenerationDriver};
//! use mapo_toolkit::sampler::SamplerClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = SamplerClient::new("localhost", 7860);
//!     let config = GenerationConfig::new("sdxl_base.safetensors");
//!
//!     let mut driver = GenerationDriver::new(client, config);
//!     let summary = driver.run("artists.json", "temp").await?;
//!     println!("generated {} images", summary.generated);
//!
//!     Ok(())
//! }
//! ```

pub mod cleanup;
pub mod config;
pub mod download;
pub mod generate;
pub mod lora;
pub mod loss;
pub mod manifest;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod preprocess;
pub mod resolution;
pub mod sampler;
pub mod tokenize;
pub mod validation;
