/**
 * Extraction stage: embedded EXIF for every stored file and every located sidecar
 */

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::artifacts::{LocationEntry, PairEntry, WorkDir};
use crate::error::StageError;
use crate::exif::{ExifBackend, ExifProcessor, ExifRead};
use crate::metadata::PhotoMetadata;
use crate::parallel::{parallel_map, try_parallel_map, Progress};
use crate::sidecar::read_sidecar;

/// Which copy of a file the extractor reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Stored,
    Source,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub side: Side,
    pub abort_on_missing: bool,
    pub use_filesystem_timestamps: bool,
    pub workers: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            side: Side::Stored,
            abort_on_missing: true,
            use_filesystem_timestamps: false,
            workers: 1,
        }
    }
}

/// One parsed sidecar belonging to a stored file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarReading {
    pub sidecar_path: PathBuf,
    pub metadata: PhotoMetadata,
}

/// Read embedded metadata for every ingested file
///
/// An empty answer from the backend stops the stage with
/// [`StageError::NoExifData`] unless `abort_on_missing` is off, in which case
/// the file gets an empty record and a warning.
pub fn extract_embedded(
    backend: &dyn ExifBackend,
    pairs: &[PairEntry],
    work: &WorkDir,
    options: &ExtractOptions,
    progress: Progress<'_>,
) -> Result<BTreeMap<String, PhotoMetadata>> {
    let processor = ExifProcessor::new(options.use_filesystem_timestamps);

    let results = try_parallel_map(
        pairs,
        |pair| -> Result<PhotoMetadata> {
            let path = match options.side {
                Side::Stored => work.current_path(pair),
                Side::Source => match pair.primary_source() {
                    Some(source) => source.to_path_buf(),
                    None => {
                        warn!("{} has no recorded source, nothing to read", pair.filename);
                        return Ok(PhotoMetadata::default());
                    }
                },
            };

            match backend.read_tags(&path)? {
                ExifRead::Tags(tags) => {
                    debug!("{}: {} tags from {}", pair.filename, tags.len(), backend.name());
                    Ok(processor.metadata_from_tags(&tags))
                }
                ExifRead::Empty { diagnostic } if options.abort_on_missing => {
                    Err(StageError::NoExifData { path, diagnostic }.into())
                }
                ExifRead::Empty { diagnostic } => {
                    warn!("No EXIF data for {}: {}", path.display(), diagnostic);
                    Ok(PhotoMetadata::default())
                }
            }
        },
        options.workers,
        progress,
    )?;

    let extracted: BTreeMap<String, PhotoMetadata> = pairs
        .iter()
        .map(|pair| pair.filename.clone())
        .zip(results)
        .collect();

    let with_datetime = extracted.values().filter(|m| m.has_datetime()).count();
    let with_gps = extracted.values().filter(|m| m.has_gps()).count();
    info!(
        "Embedded extraction complete: {} files, {} with datetime, {} with GPS",
        extracted.len(),
        with_datetime,
        with_gps
    );
    Ok(extracted)
}

/// Every sidecar recorded for an entry: the primary match, then those of duplicate sources
fn sidecar_paths(location: &LocationEntry) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = location.metadata_file.iter().cloned().collect();
    for candidate in &location.candidates {
        if !paths.contains(candidate) {
            paths.push(candidate.clone());
        }
    }
    paths
}

/// Parse every located sidecar
///
/// A sidecar that cannot be read or parsed is a per-file warning; the entry
/// keeps whatever other sidecars it has.
pub fn extract_sidecars(
    locations: &BTreeMap<String, LocationEntry>,
    utc_offset_hours: i32,
    workers: usize,
    progress: Progress<'_>,
) -> Result<BTreeMap<String, Vec<SidecarReading>>> {
    let entries: Vec<(&String, &LocationEntry)> = locations.iter().filter(|(_, l)| l.found).collect();

    let readings = parallel_map(
        &entries,
        |(filename, location)| {
            sidecar_paths(location)
                .into_iter()
                .filter_map(|sidecar_path| match read_sidecar(&sidecar_path, utc_offset_hours) {
                    Ok(metadata) => Some(SidecarReading { sidecar_path, metadata }),
                    Err(e) => {
                        warn!("Skipping sidecar for {}: {:#}", filename, e);
                        None
                    }
                })
                .collect::<Vec<_>>()
        },
        workers,
        progress,
    )?;

    let sidecars: BTreeMap<String, Vec<SidecarReading>> = entries
        .iter()
        .map(|(filename, _)| (*filename).clone())
        .zip(readings)
        .filter(|(_, readings)| !readings.is_empty())
        .collect();

    let with_datetime = sidecars
        .values()
        .filter(|r| r.iter().any(|s| s.metadata.has_datetime()))
        .count();
    info!(
        "Sidecar extraction complete: {} of {} located sidecars parsed, {} with datetime",
        sidecars.len(),
        entries.len(),
        with_datetime
    );
    Ok(sidecars)
}
