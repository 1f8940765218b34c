//! Converter configuration.
//!
//! Loaded from a JSON file; every key is required. The storage and
//! upload directories are created when absent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertConfig {
    /// Telemetry log collector (`host:port`); consumed by the external
    /// metrics emitter.
    pub heka_server: String,
    /// Source of histogram revision JSON (`host:port`).
    pub histogram_server: String,
    /// Path to the dimension schema JSON.
    pub telemetry_schema: PathBuf,
    /// Work directory for in-progress partition files.
    pub storage_path: PathBuf,
    /// Directory finalized partition files are published into.
    pub upload_path: PathBuf,
    /// Per-partition rotation threshold in bytes.
    pub max_uncompressed: u64,
    /// Soft memory limit governing the encoder pool, in bytes.
    pub memory_constraint: u64,
    /// LZMA preset, 0..=9.
    pub compression_preset: u32,
}

impl ConvertConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read(path)
            .with_context(|| format!("file open failed: {}", path.display()))?;
        let config: ConvertConfig = serde_json::from_slice(&json)
            .with_context(|| format!("invalid config: {}", path.display()))?;

        anyhow::ensure!(
            config.compression_preset <= 9,
            "compression_preset must be in 0..=9, got {}",
            config.compression_preset
        );

        std::fs::create_dir_all(&config.storage_path).with_context(|| {
            format!("creating storage_path: {}", config.storage_path.display())
        })?;
        std::fs::create_dir_all(&config.upload_path).with_context(|| {
            format!("creating upload_path: {}", config.upload_path.display())
        })?;

        Ok(config)
    }
}
