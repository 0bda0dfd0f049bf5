pub mod artifacts;
pub mod config;
pub mod error;
pub mod exif;
pub mod exif_writer;
pub mod extract;
pub mod file_ops;
pub mod hashing;
pub mod metadata;
pub mod parallel;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod sidecar;

pub use config::Config;
pub use error::{ExifError, StageError};
pub use exif::{ExifBackend, ExifTool, MemoryBackend, NativeReader};
pub use metadata::{GpsCoord, PhotoMetadata};
pub use pipeline::Pipeline;
