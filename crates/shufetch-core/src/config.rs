use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::HttpParams;
use crate::wire::Codec;

/// Shuffle input configuration loaded from `~/.config/shufetch/config.toml`.
///
/// The fractions are resolved against the container memory handed to
/// `memory_limits`; everything else feeds the fetcher builder directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Fraction of container memory devoted to buffering fetched inputs.
    pub shuffle_buffer_fraction: f64,
    /// Per-attempt cap as a fraction of the shuffle buffer; larger attempts go to disk.
    pub max_single_memory_segment_fraction: f64,
    /// Fill level at which the merger starts spilling. Carried for the merger;
    /// the fetcher itself never reads it.
    pub merge_fraction: f64,
    /// Fetch over https instead of http.
    pub encrypted_transfer: bool,
    /// Prefetch hint for the decompressing payload reader.
    pub ifile_read_ahead: bool,
    pub ifile_read_ahead_bytes: usize,
    /// Codec name the producers compressed with (e.g. "zlib"); None for raw.
    pub compression_codec: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Ask the serving daemon to keep the connection alive between batches.
    pub keep_alive: bool,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            shuffle_buffer_fraction: 0.70,
            max_single_memory_segment_fraction: 0.25,
            merge_fraction: 0.66,
            encrypted_transfer: false,
            ifile_read_ahead: true,
            ifile_read_ahead_bytes: 4 * 1024 * 1024,
            compression_codec: None,
            connect_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            keep_alive: false,
        }
    }
}

/// Byte limits resolved from the configured fractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Total in-memory shuffle budget.
    pub buffer_bytes: u64,
    /// Largest single attempt allowed in memory.
    pub max_single_bytes: u64,
}

impl ShuffleConfig {
    /// Resolve the buffer fractions against the container memory size.
    pub fn memory_limits(&self, container_bytes: u64) -> MemoryLimits {
        let buffer_bytes = (container_bytes as f64 * self.shuffle_buffer_fraction) as u64;
        let max_single_bytes =
            (buffer_bytes as f64 * self.max_single_memory_segment_fraction) as u64;
        MemoryLimits {
            buffer_bytes,
            max_single_bytes,
        }
    }

    pub fn http_params(&self) -> HttpParams {
        HttpParams {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            keep_alive: self.keep_alive,
        }
    }

    /// Codec the producers compressed with, if any.
    pub fn codec(&self) -> Result<Option<Codec>> {
        match self.compression_codec.as_deref() {
            None => Ok(None),
            Some(name) => match Codec::from_name(name) {
                Some(codec) => Ok(Some(codec)),
                None => bail!("unknown compression codec: {}", name),
            },
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("shufetch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<ShuffleConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ShuffleConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: ShuffleConfig = toml::from_str(&data)?;
    Ok(cfg)
}
