/**
 * Pipeline configuration loaded from an optional TOML file
 *
 * Every key has a built-in default, so an empty file (or no file at all)
 * gives a working pipeline. Command-line flags override file values.
 */

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::reconcile::Tolerance;
use crate::retry::{Backoff, RetryPolicy};
use crate::error::ExifError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker threads per stage (default: derived from CPU count)
    pub workers: Option<usize>,
    pub media: MediaConfig,
    pub tolerance: Tolerance,
    pub sidecar: SidecarConfig,
    pub extract: ExtractConfig,
    pub exiftool: ExifToolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub image_extensions: Vec<String>,
    pub video_extensions: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let to_owned = |exts: &[&str]| exts.iter().map(|e| e.to_string()).collect();
        Self {
            image_extensions: to_owned(&[
                "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "heic", "heif",
                "raw", "cr2", "nef", "arw", "dng", "jp2",
            ]),
            video_extensions: to_owned(&[
                "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v", "3gp", "mp",
            ]),
        }
    }
}

impl MediaConfig {
    /// Lower-cased extensions without the leading dot
    pub fn extension_set(&self) -> HashSet<String> {
        self.image_extensions
            .iter()
            .chain(self.video_extensions.iter())
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect()
    }

    pub fn video_set(&self) -> HashSet<String> {
        self.video_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Offset added to sidecar UTC timestamps to get local capture time
    pub utc_offset_hours: i32,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self { utc_offset_hours: 9 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Fall back to File:FileModifyDate and friends when no EXIF date exists
    pub use_filesystem_timestamps: bool,
    /// Stop the stage when exiftool returns nothing for a file
    pub abort_on_missing: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            use_filesystem_timestamps: false,
            abort_on_missing: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExifToolConfig {
    pub path: PathBuf,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ExifToolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("exiftool"),
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl ExifToolConfig {
    pub fn retry_policy(&self) -> RetryPolicy<ExifError> {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::Exponential {
                base_ms: self.backoff_ms,
                max_ms: self.backoff_ms.saturating_mul(16),
            },
            ExifError::is_transient,
        )
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    /// Load `path` when given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
