//! Idempotent lake writer.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use quarry_utils::atomic_write::write_bytes_atomic;
use quarry_utils::canonical::{canonicalize, sha256_hex};
use quarry_utils::error::CanonicalError;

#[derive(Error, Debug)]
pub enum LakeError {
    #[error("lake I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lake write failed at {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("canonicalization failed: {0}")]
    Canonical(#[from] CanonicalError),
}

/// Whether a write touched the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    Written,
    Skipped,
}

/// Result of one lake write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReceipt {
    /// Path relative to the lake base.
    pub lake_uri: String,
    pub content_sha256: String,
    pub byte_count: usize,
    pub status: WriteStatus,
}

/// Filesystem-backed lake rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FileLakeWriter {
    base: Utf8PathBuf,
}

impl FileLakeWriter {
    #[must_use]
    pub fn new(base: impl Into<Utf8PathBuf>) -> Self {
        Self { base: base.into() }
    }

    #[must_use]
    pub fn base(&self) -> &Utf8Path {
        &self.base
    }

    /// Write bytes at `rel_path` (relative to the base). The digest is
    /// computed first; an existing file with the same digest short-circuits
    /// to `Skipped` without touching the filesystem.
    pub fn write_bytes(&self, rel_path: &Utf8Path, content: &[u8]) -> Result<WriteReceipt, LakeError> {
        let content_sha256 = sha256_hex(content);
        let target = self.base.join(rel_path);

        if target.exists() {
            let existing = fs::read(target.as_std_path()).map_err(|e| LakeError::Io {
                path: target.to_string(),
                source: e,
            })?;
            if sha256_hex(&existing) == content_sha256 {
                debug!(lake_uri = %rel_path, "digest match, skipping write");
                return Ok(WriteReceipt {
                    lake_uri: rel_path.to_string(),
                    content_sha256,
                    byte_count: content.len(),
                    status: WriteStatus::Skipped,
                });
            }
        }

        write_bytes_atomic(&target, content).map_err(|e| LakeError::Write {
            path: target.to_string(),
            reason: e.to_string(),
        })?;

        debug!(lake_uri = %rel_path, bytes = content.len(), "wrote lake file");
        Ok(WriteReceipt {
            lake_uri: rel_path.to_string(),
            content_sha256,
            byte_count: content.len(),
            status: WriteStatus::Written,
        })
    }

    /// Write a value as canonical JSON.
    pub fn write_json(&self, rel_path: &Utf8Path, value: &Value) -> Result<WriteReceipt, LakeError> {
        let canonical = canonicalize(value)?;
        self.write_bytes(rel_path, canonical.as_bytes())
    }

    /// Write UTF-8 text.
    pub fn write_text(&self, rel_path: &Utf8Path, content: &str) -> Result<WriteReceipt, LakeError> {
        self.write_bytes(rel_path, content.as_bytes())
    }

    /// Read a lake file back (testing and verification).
    pub fn read_bytes(&self, rel_path: &Utf8Path) -> Result<Vec<u8>, LakeError> {
        let target = self.base.join(rel_path);
        fs::read(target.as_std_path()).map_err(|e| LakeError::Io {
            path: target.to_string(),
            source: e,
        })
    }
}
