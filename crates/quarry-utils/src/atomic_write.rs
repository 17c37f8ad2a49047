//! Atomic file writes: temp file in the target directory, fsync, rename.
//!
//! Lake files must never be observable half-written; readers either see the
//! previous content or the full new content. Any failure unlinks the temp
//! file (NamedTempFile removes itself on drop).

use std::fs;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use tempfile::NamedTempFile;

/// Atomically write bytes to `path`, creating parent directories as needed.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory: {parent}"))?;
    }

    let temp_dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut temp_file = NamedTempFile::new_in(temp_dir)
        .with_context(|| format!("failed to create temporary file in: {temp_dir}"))?;

    temp_file
        .write_all(content)
        .context("failed to write content to temporary file")?;

    temp_file
        .as_file()
        .sync_all()
        .context("failed to fsync temporary file")?;

    temp_file
        .persist(path.as_std_path())
        .map_err(|e| anyhow::anyhow!(e.error))
        .with_context(|| format!("failed to atomically rename into place: {path}"))?;

    Ok(())
}

/// Atomically write a UTF-8 string to `path`.
pub fn write_text_atomic(path: &Utf8Path, content: &str) -> Result<()> {
    write_bytes_atomic(path, content.as_bytes())
}
