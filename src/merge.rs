//! Merge a sharded safetensors checkpoint into a single file
//!
//! Sharded checkpoints ship with an index (`*.safetensors.index.json`) whose
//! `weight_map` names the shard holding each tensor. Every referenced shard is
//! read fully into memory; tensors are copied byte-for-byte (dtype and shape
//! untouched) into one output file.

use anyhow::{Context, Result};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Parsed `*.safetensors.index.json`
#[derive(Debug, Clone, Deserialize)]
pub struct WeightIndex {
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Tensor name -> shard file name
    pub weight_map: BTreeMap<String, String>,
}

impl WeightIndex {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read weight index: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse weight index: {}", path.display()))
    }

    /// Distinct shard files referenced by the index
    pub fn shards(&self) -> BTreeSet<&str> {
        self.weight_map.values().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub tensors: usize,
    pub shards: usize,
    pub total_bytes: usize,
}

/// Merge the shards listed in `index_path` into `output_path`
///
/// Shards are looked up in `shard_dir`, or next to the index when `None`.
/// A shard or tensor missing from disk aborts the merge before anything is
/// written.
pub fn merge_shards(
    index_path: &Path,
    shard_dir: Option<&Path>,
    output_path: &Path,
) -> Result<MergeReport> {
    let index = WeightIndex::load(index_path)?;
    let shard_dir: PathBuf = match shard_dir {
        Some(dir) => dir.to_path_buf(),
        None => index_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };

    info!(
        index = %index_path.display(),
        tensors = index.weight_map.len(),
        shards = index.shards().len(),
        "Merging sharded checkpoint"
    );

    let mut shard_bytes: HashMap<&str, Vec<u8>> = HashMap::new();
    for shard in index.shards() {
        let path = shard_dir.join(shard);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read shard: {}", path.display()))?;
        debug!(shard = %shard, size_mb = bytes.len() / (1024 * 1024), "Shard loaded");
        shard_bytes.insert(shard, bytes);
    }

    let mut parsed: HashMap<&str, SafeTensors<'_>> = HashMap::new();
    for (shard, bytes) in &shard_bytes {
        let tensors = SafeTensors::deserialize(bytes)
            .with_context(|| format!("Failed to parse shard: {}", shard))?;
        parsed.insert(*shard, tensors);
    }

    let mut merged: BTreeMap<&str, TensorView<'_>> = BTreeMap::new();
    let mut total_bytes = 0;
    for (name, shard) in &index.weight_map {
        let tensors = &parsed[shard.as_str()];
        let view = tensors
            .tensor(name)
            .with_context(|| format!("Tensor {} not found in shard {}", name, shard))?;
        total_bytes += view.data().len();
        merged.insert(name.as_str(), view);
    }

    let metadata = shard_metadata(&shard_bytes);

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    safetensors::serialize_to_file(merged, &metadata, output_path)
        .with_context(|| format!("Failed to write merged file: {}", output_path.display()))?;

    let report = MergeReport {
        tensors: index.weight_map.len(),
        shards: shard_bytes.len(),
        total_bytes,
    };

    info!(
        output = %output_path.display(),
        tensors = report.tensors,
        size_mb = report.total_bytes / (1024 * 1024),
        "✓ Merged model saved"
    );

    Ok(report)
}

/// Header metadata (e.g. `format: pt`) of the first shard that has any
fn shard_metadata(shards: &HashMap<&str, Vec<u8>>) -> Option<HashMap<String, String>> {
    let mut names: Vec<&&str> = shards.keys().collect();
    names.sort();
    names.into_iter().find_map(|name| {
        SafeTensors::read_metadata(&shards[*name])
            .ok()
            .and_then(|(_, metadata)| metadata.metadata().clone())
    })
}
