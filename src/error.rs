/**
 * Error types shared by the pipeline stages
 */

use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by an EXIF backend
#[derive(Debug, Error)]
pub enum ExifError {
    #[error("failed to launch exiftool '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exiftool exited with {status} for {path}: {stderr}")]
    Failed {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("could not parse exiftool output for {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{backend} backend cannot write tags")]
    ReadOnly { backend: &'static str },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExifError {
    /// Errors worth retrying: the tool could not be started or was interrupted
    pub fn is_transient(&self) -> bool {
        match self {
            ExifError::Spawn { source, .. } | ExifError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Conditions that stop a stage instead of skipping a single file
#[derive(Debug, Error)]
pub enum StageError {
    #[error("exiftool returned no data for {path}; check the extraction toolchain ({diagnostic})")]
    NoExifData { path: PathBuf, diagnostic: String },

    #[error("required artifact {path} is missing; run the '{stage}' stage first")]
    MissingArtifact { path: PathBuf, stage: &'static str },
}
