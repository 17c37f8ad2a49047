//! Content-stable text chunking.
//!
//! Windows are measured in characters; offsets are recorded in bytes into
//! the original text, so `&text[chunk.start..chunk.end]` equals the chunk
//! content byte-exactly. Chunk ids are derived from source identity and
//! policy version, never from the content, so two sources with identical
//! text still produce distinct ids.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use quarry_utils::canonical::sha256_hex;

/// Policy governing the chunking pass. `chunk_size` and `overlap` are in
/// characters; recorded offsets are byte positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingPolicy {
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_chunks_per_source: Option<usize>,
    pub version: String,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 2000,
            overlap: 200,
            max_chunks_per_source: None,
            version: "1.0".to_string(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkPolicyError {
    #[error("chunk_size must be positive")]
    ChunkSizeNotPositive,
    #[error("overlap must be less than chunk_size")]
    OverlapTooLarge,
}

impl ChunkingPolicy {
    pub fn validate(&self) -> Result<(), ChunkPolicyError> {
        if self.chunk_size == 0 {
            return Err(ChunkPolicyError::ChunkSizeNotPositive);
        }
        if self.overlap >= self.chunk_size {
            return Err(ChunkPolicyError::OverlapTooLarge);
        }
        Ok(())
    }
}

/// Byte offsets of a chunk within its source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOffsets {
    pub start: usize,
    pub end: usize,
    pub chunk_index: usize,
}

/// One chunk of a source document, ready for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Deterministic over (source_id, source_type, chunk_index, policy version).
    pub chunk_id: String,
    pub source_type: String,
    pub source_ref: Option<Value>,
    pub content: String,
    pub content_sha256: String,
    pub byte_count: usize,
    pub offsets: ChunkOffsets,
    /// Snapshot of the policy that produced this chunk.
    pub policy: Value,
}

/// Split `text` into windows of up to `chunk_size` characters with exactly
/// `chunk_size - overlap` step. Returns `(content, start_byte, end_byte)`
/// triples; empty input yields an empty vec.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<(String, usize, usize)>, ChunkPolicyError> {
    if chunk_size == 0 {
        return Err(ChunkPolicyError::ChunkSizeNotPositive);
    }
    if overlap >= chunk_size {
        return Err(ChunkPolicyError::OverlapTooLarge);
    }
    if text.is_empty() {
        return Ok(Vec::new());
    }

    // Byte position of each character boundary, plus the end of the text.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    bounds.push(text.len());
    let n_chars = bounds.len() - 1;

    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + chunk_size).min(n_chars);
        let (start_byte, end_byte) = (bounds[start], bounds[end]);
        chunks.push((text[start_byte..end_byte].to_string(), start_byte, end_byte));

        if end == n_chars {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

/// Applies a [`ChunkingPolicy`] and stamps each window into a [`ChunkRecord`].
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    pub policy: ChunkingPolicy,
}

impl Chunker {
    #[must_use]
    pub fn new(policy: ChunkingPolicy) -> Self {
        Self { policy }
    }

    /// Chunk `content` for the given source identity. The chunk id is
    /// `sha256("{source_id}|{source_type}|{index}|{policy_version}")`.
    pub fn chunk(
        &self,
        content: &str,
        source_id: &str,
        source_type: &str,
        source_ref: Option<Value>,
    ) -> Result<Vec<ChunkRecord>, ChunkPolicyError> {
        self.policy.validate()?;

        let mut windows = chunk_text(content, self.policy.chunk_size, self.policy.overlap)?;
        if let Some(max) = self.policy.max_chunks_per_source {
            windows.truncate(max);
        }

        let policy_snapshot = json!({
            "chunk_size": self.policy.chunk_size,
            "overlap": self.policy.overlap,
            "max_chunks_per_source": self.policy.max_chunks_per_source,
            "version": self.policy.version,
        });

        Ok(windows
            .into_iter()
            .enumerate()
            .map(|(index, (text, start, end))| {
                let id_input = format!(
                    "{source_id}|{source_type}|{index}|{}",
                    self.policy.version
                );
                let content_sha256 = sha256_hex(text.as_bytes());
                let byte_count = text.len();
                ChunkRecord {
                    chunk_id: sha256_hex(id_input.as_bytes()),
                    source_type: source_type.to_string(),
                    source_ref: source_ref.clone(),
                    content: text,
                    content_sha256,
                    byte_count,
                    offsets: ChunkOffsets {
                        start,
                        end,
                        chunk_index: index,
                    },
                    policy: policy_snapshot.clone(),
                }
            })
            .collect())
    }
}
