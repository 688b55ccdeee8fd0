//! Dataset manifest tracking per-image generation progress
//!
//! The manifest maps artist name -> image name -> [`ImageRecord`]. It is read
//! once at startup and rewritten in full after every generated image, so a
//! crashed run resumes at image granularity.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Separator used in tags between the character and general tag groups
pub const TAG_GROUP_SEPARATOR: &str = "|||";

/// One source image described by the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub tag: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub generated: bool,
    /// Fields written by other tools, kept as-is on rewrite
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ImageRecord {
    /// Prompt sent to the generator: the tag without group separators
    pub fn prompt(&self) -> String {
        self.tag.replace(TAG_GROUP_SEPARATOR, "").trim().to_string()
    }
}

/// Images of a single artist, in manifest order
pub type ArtistImages = IndexMap<String, ImageRecord>;

/// Full manifest keyed by artist name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub artists: IndexMap<String, ArtistImages>,
}

impl Manifest {
    /// Load a manifest from a UTF-8 JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

        debug!(
            path = %path.display(),
            artists = manifest.artists.len(),
            images = manifest.image_count(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    /// Rewrite the whole manifest as pretty-printed JSON
    ///
    /// The document is written next to `path` first and then renamed over it.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;

        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        std::fs::write(&tmp_path, text)
            .with_context(|| format!("Failed to write manifest: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to replace manifest: {}", path.display()))?;
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.artists.values().map(|images| images.len()).sum()
    }

    /// Number of images already marked as generated
    pub fn generated_count(&self) -> usize {
        self.artists
            .values()
            .flat_map(|images| images.values())
            .filter(|record| record.generated)
            .count()
    }

    /// Names of the artist's images that still need generating, in order
    pub fn pending(&self, artist: &str) -> Vec<String> {
        self.artists
            .get(artist)
            .map(|images| {
                images
                    .iter()
                    .filter(|(_, record)| !record.generated)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record(&self, artist: &str, image: &str) -> Option<&ImageRecord> {
        self.artists.get(artist).and_then(|images| images.get(image))
    }

    /// Flag an image as generated. Returns false if the entry does not exist.
    pub fn mark_generated(&mut self, artist: &str, image: &str) -> bool {
        match self.artists.get_mut(artist).and_then(|images| images.get_mut(image)) {
            Some(record) => {
                record.generated = true;
                true
            }
            None => false,
        }
    }
}
