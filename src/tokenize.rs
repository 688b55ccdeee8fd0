//! Caption tokenization for the SDXL dual text encoders
//!
//! Captions longer than the encoders' 77-token window are tokenized to a
//! longer `max_length` and then split into several 77-token windows, each
//! wrapped with its own BOS/EOS so the encoders can process them as a batch.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;
use tokenizers::{
    models::bpe::BPE, normalizers::Lowercase, pre_tokenizers::whitespace::Whitespace,
    processors::template::TemplateProcessing, AddedToken, Tokenizer,
};
use tracing::debug;

use crate::manifest::TAG_GROUP_SEPARATOR;

/// Default token budget for long captions (three 75-token windows + BOS/EOS)
pub const DEFAULT_MAX_LENGTH: usize = 255;

const BOS_TOKEN: &str = "<|startoftext|>";
const EOS_TOKEN: &str = "<|endoftext|>";
const BOS_TOKEN_ID: u32 = 49406;
const EOS_TOKEN_ID: u32 = 49407;

/// Special-token layout of a CLIP tokenizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerSpec {
    pub model_max_length: usize,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
}

impl TokenizerSpec {
    /// First SDXL tokenizer (CLIP ViT-L): pads with EOS
    pub fn clip_l() -> Self {
        Self {
            model_max_length: 77,
            eos_token_id: EOS_TOKEN_ID,
            pad_token_id: EOS_TOKEN_ID,
        }
    }

    /// Second SDXL tokenizer (OpenCLIP bigG): pads with `!` (id 0)
    pub fn clip_g() -> Self {
        Self {
            model_max_length: 77,
            eos_token_id: EOS_TOKEN_ID,
            pad_token_id: 0,
        }
    }

    fn pad_token(&self) -> String {
        if self.pad_token_id == self.eos_token_id {
            EOS_TOKEN.to_string()
        } else {
            "!".to_string()
        }
    }
}

/// Shuffle the comma-separated tags inside each of the two tag groups
///
/// Captions of the form `"a, b ||| c, d"` have each group shuffled
/// independently and are re-joined with `,` (first group first). Captions
/// without exactly one separator are returned unchanged.
pub fn shuffle_caption<R: Rng + ?Sized>(caption: &str, rng: &mut R) -> String {
    let parts: Vec<&str> = caption.split(TAG_GROUP_SEPARATOR).collect();
    if parts.len() != 2 {
        return caption.to_string();
    }

    let mut first: Vec<&str> = parts[0].trim().split(',').collect();
    let mut second: Vec<&str> = parts[1].trim().split(',').collect();
    first.shuffle(rng);
    second.shuffle(rng);

    first.into_iter().chain(second).collect::<Vec<_>>().join(",")
}

/// Split a long id sequence into `model_max_length` windows
///
/// Each window is `[BOS] + ids[i .. i + m - 2] + [last id]`. A window whose
/// content does not end in EOS/PAD gets EOS as its last token, and a window
/// that starts with padding gets EOS right after BOS. Sequences that already
/// fit are returned as a single row.
pub fn chunk_input_ids(ids: &[u32], spec: &TokenizerSpec, max_length: usize) -> Vec<Vec<u32>> {
    let m = spec.model_max_length;
    if max_length <= m || ids.is_empty() {
        return vec![ids.to_vec()];
    }

    let bos = ids[0];
    let last = ids[ids.len() - 1];
    let mut chunks = Vec::new();

    let mut i = 1;
    while i < max_length - m + 2 {
        let end = (i + m - 2).min(ids.len());
        let start = i.min(end);

        let mut chunk = Vec::with_capacity(m);
        chunk.push(bos);
        chunk.extend_from_slice(&ids[start..end]);
        chunk.push(last);

        let n = chunk.len();
        if n >= 3 {
            let before_last = chunk[n - 2];
            if before_last != spec.eos_token_id && before_last != spec.pad_token_id {
                chunk[n - 1] = spec.eos_token_id;
            }
            if chunk[1] == spec.pad_token_id {
                chunk[1] = spec.eos_token_id;
            }
        }

        chunks.push(chunk);
        i += m - 2;
    }

    chunks
}

/// A tokenizer padded and truncated to a fixed caption length
pub struct CaptionTokenizer {
    tokenizer: Tokenizer,
    spec: TokenizerSpec,
    max_length: usize,
}

impl CaptionTokenizer {
    /// Load from `tokenizer.json` or from a directory with `vocab.json` + `merges.txt`
    pub fn load<P: AsRef<Path>>(path: P, spec: TokenizerSpec, max_length: usize) -> Result<Self> {
        let path = path.as_ref();

        let tokenizer = if path.is_file() {
            Tokenizer::from_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {:?}: {}", path, e))?
        } else if path.join("tokenizer.json").exists() {
            Tokenizer::from_file(path.join("tokenizer.json"))
                .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {:?}: {}", path, e))?
        } else {
            load_bpe_tokenizer(path)?
        };

        debug!(path = %path.display(), max_length, "Caption tokenizer loaded");
        Self::from_tokenizer(tokenizer, spec, max_length)
    }

    /// Wrap an existing tokenizer, forcing fixed-length padding and truncation
    pub fn from_tokenizer(mut tokenizer: Tokenizer, spec: TokenizerSpec, max_length: usize) -> Result<Self> {
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::Fixed(max_length),
            pad_id: spec.pad_token_id,
            pad_token: spec.pad_token(),
            ..Default::default()
        }));

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

        Ok(Self {
            tokenizer,
            spec,
            max_length,
        })
    }

    pub fn spec(&self) -> &TokenizerSpec {
        &self.spec
    }

    /// Token ids of one caption, exactly `max_length` long
    pub fn encode(&self, caption: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(caption, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Token windows of one caption, `[chunks][model_max_length]`
    pub fn encode_chunked(&self, caption: &str) -> Result<Vec<Vec<u32>>> {
        let ids = self.encode(caption)?;
        Ok(chunk_input_ids(&ids, &self.spec, self.max_length))
    }
}

/// Build a CLIP BPE tokenizer from `vocab.json` + `merges.txt`
fn load_bpe_tokenizer(tokenizer_dir: &Path) -> Result<Tokenizer> {
    let vocab_path = tokenizer_dir.join("vocab.json");
    let merges_path = tokenizer_dir.join("merges.txt");

    if !vocab_path.exists() || !merges_path.exists() {
        anyhow::bail!(
            "BPE tokenizer requires vocab.json and merges.txt in {}",
            tokenizer_dir.display()
        );
    }

    let bpe = BPE::from_file(&vocab_path.to_string_lossy(), &merges_path.to_string_lossy())
        .end_of_word_suffix("</w>".to_string())
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build BPE tokenizer: {}", e))?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.with_normalizer(Some(Lowercase));
    tokenizer.with_pre_tokenizer(Some(Whitespace {}));

    tokenizer.add_special_tokens(&[
        AddedToken::from(BOS_TOKEN, true),
        AddedToken::from(EOS_TOKEN, true),
    ]);

    let processor = TemplateProcessing::builder()
        .try_single(format!("{} $A {}", BOS_TOKEN, EOS_TOKEN))
        .map_err(|e| anyhow::anyhow!("Template processing failed: {}", e))?
        .special_tokens(vec![(BOS_TOKEN, BOS_TOKEN_ID), (EOS_TOKEN, EOS_TOKEN_ID)])
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build processor: {}", e))?;

    tokenizer.with_post_processor(Some(processor));

    Ok(tokenizer)
}

/// Tokenize a batch of captions with both tokenizers
///
/// Each caption's tag groups are shuffled once and the same text goes to both
/// tokenizers. Returns two `u32` tensors of shape `[batch, chunks, 77]`.
pub fn tokenize_captions<R: Rng + ?Sized>(
    tokenizers: [&CaptionTokenizer; 2],
    captions: &[String],
    rng: &mut R,
) -> Result<(Tensor, Tensor)> {
    let captions: Vec<String> = captions
        .iter()
        .map(|caption| shuffle_caption(caption, rng))
        .collect();

    let tokens_one = stack_chunks(tokenizers[0], &captions)?;
    let tokens_two = stack_chunks(tokenizers[1], &captions)?;
    Ok((tokens_one, tokens_two))
}

fn stack_chunks(tokenizer: &CaptionTokenizer, captions: &[String]) -> Result<Tensor> {
    let mut flat = Vec::new();
    let mut shape = (captions.len(), 0, 0);

    for caption in captions {
        let chunks = tokenizer.encode_chunked(caption)?;
        shape.1 = chunks.len();
        shape.2 = chunks.first().map(|c| c.len()).unwrap_or(0);
        for chunk in chunks {
            flat.extend(chunk);
        }
    }

    Ok(Tensor::from_vec(flat, shape, &Device::Cpu)?)
}

/// Tiny word-level CLIP-like tokenizer for tests: "a".."d" -> 10..13, "," -> 14
#[cfg(test)]
pub(crate) fn word_tokenizer(spec: TokenizerSpec, max_length: usize) -> CaptionTokenizer {
    let mut vocab: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    vocab.insert("!".to_string(), 0);
    vocab.insert("[UNK]".to_string(), 1);
    for (i, word) in ["a", "b", "c", "d", ","].iter().enumerate() {
        vocab.insert(word.to_string(), 10 + i as u32);
    }
    vocab.insert(BOS_TOKEN.to_string(), BOS_TOKEN_ID);
    vocab.insert(EOS_TOKEN.to_string(), EOS_TOKEN_ID);

    let model = tokenizers::models::wordlevel::WordLevel::builder()
        .vocab(vocab.into_iter().collect())
        .unk_token("[UNK]".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace {}));
    tokenizer.add_special_tokens(&[
        AddedToken::from(BOS_TOKEN, true),
        AddedToken::from(EOS_TOKEN, true),
    ]);
    let processor = TemplateProcessing::builder()
        .try_single(format!("{} $A {}", BOS_TOKEN, EOS_TOKEN))
        .unwrap()
        .special_tokens(vec![(BOS_TOKEN, BOS_TOKEN_ID), (EOS_TOKEN, EOS_TOKEN_ID)])
        .build()
        .unwrap();
    tokenizer.with_post_processor(Some(processor));

    CaptionTokenizer::from_tokenizer(tokenizer, spec, max_length).unwrap()
}
