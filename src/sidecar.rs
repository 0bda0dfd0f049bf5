/**
 * Sidecar metadata files exported next to media (Google Takeout style)
 *
 * Lookup is a fixed precedence list; the first existing candidate wins.
 * Same-directory filename patterns come first, directory heuristics last.
 */

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifacts::{LocationEntry, PairEntry};
use crate::metadata::{GpsCoord, PhotoMetadata};
use crate::parallel::{parallel_map, Progress};

const SUPPLEMENTAL: &str = "supplemental-metadata";
const METADATA_DIRS: &[&str] = &["metadata", "photo-metadata", "image-metadata"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarPattern {
    /// `IMG_1.jpg.supplemental-metadata.json`
    Supplemental,
    /// `IMG(1).jpg` -> `IMG.jpg.supplemental-metadata(1).json`
    SupplementalNumbered,
    /// `IMG_1.jpg.supplemental-meta.json` (name length cap)
    SupplementalTruncated,
    /// `IMG_1.jpg.json`
    FilenameJson,
    /// `IMG_1.json`
    StemJson,
    /// `IMG_1.metadata.json`
    StemMetadataJson,
    /// `IMG_1.supplemental-metadata.json`
    StemSupplemental,
    /// `metadata/IMG_1.jpg.json` (or `photo-metadata/`, `image-metadata/`) beside the file or in its parent
    MetadataDirectory,
}

impl SidecarPattern {
    pub fn name(&self) -> &'static str {
        match self {
            SidecarPattern::Supplemental => "supplemental-metadata",
            SidecarPattern::SupplementalNumbered => "supplemental-metadata-numbered",
            SidecarPattern::SupplementalTruncated => "supplemental-metadata-truncated",
            SidecarPattern::FilenameJson => "filename-json",
            SidecarPattern::StemJson => "stem-json",
            SidecarPattern::StemMetadataJson => "stem-metadata-json",
            SidecarPattern::StemSupplemental => "stem-supplemental-metadata",
            SidecarPattern::MetadataDirectory => "metadata-directory",
        }
    }

    /// `file` for same-directory matches, `directory` for heuristics
    pub fn kind(&self) -> &'static str {
        match self {
            SidecarPattern::MetadataDirectory => "directory",
            _ => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarLocation {
    pub found: bool,
    pub sidecar_path: Option<PathBuf>,
    pub pattern: Option<SidecarPattern>,
}

impl SidecarLocation {
    fn missing() -> Self {
        Self { found: false, sidecar_path: None, pattern: None }
    }
}

/// Split `IMG(12).jpg` into (`IMG.jpg`, 12)
fn split_duplicate_counter(filename: &str) -> Option<(String, u32)> {
    let (stem, ext) = match filename.rfind('.') {
        Some(idx) => (&filename[..idx], &filename[idx..]),
        None => (filename, ""),
    };
    let open = stem.rfind('(')?;
    let inner = stem.strip_suffix(')')?.get(open + 1..)?;
    let counter: u32 = inner.parse().ok()?;
    Some((format!("{}{}", &stem[..open], ext), counter))
}

/// Every candidate path for `source`, in precedence order
pub fn candidate_paths(source: &Path) -> Vec<(PathBuf, SidecarPattern)> {
    let Some(dir) = source.parent() else {
        return Vec::new();
    };
    let Some(filename) = source.file_name().map(|f| f.to_string_lossy().to_string()) else {
        return Vec::new();
    };
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.clone());

    let mut candidates = vec![(
        dir.join(format!("{}.{}.json", filename, SUPPLEMENTAL)),
        SidecarPattern::Supplemental,
    )];

    if let Some((base, counter)) = split_duplicate_counter(&filename) {
        candidates.push((
            dir.join(format!("{}.{}({}).json", base, SUPPLEMENTAL, counter)),
            SidecarPattern::SupplementalNumbered,
        ));
    }

    for len in (1..SUPPLEMENTAL.len()).rev() {
        candidates.push((
            dir.join(format!("{}.{}.json", filename, &SUPPLEMENTAL[..len])),
            SidecarPattern::SupplementalTruncated,
        ));
    }

    candidates.push((dir.join(format!("{}.json", filename)), SidecarPattern::FilenameJson));
    candidates.push((dir.join(format!("{}.json", stem)), SidecarPattern::StemJson));
    candidates.push((dir.join(format!("{}.metadata.json", stem)), SidecarPattern::StemMetadataJson));
    candidates.push((dir.join(format!("{}.{}.json", stem, SUPPLEMENTAL)), SidecarPattern::StemSupplemental));

    let mut roots = vec![dir];
    roots.extend(dir.parent());
    let metadata_dirs: Vec<PathBuf> = roots
        .iter()
        .flat_map(|root| METADATA_DIRS.iter().map(move |name| root.join(name)))
        .collect();
    for metadata_dir in metadata_dirs {
        candidates.push((metadata_dir.join(format!("{}.json", filename)), SidecarPattern::MetadataDirectory));
        candidates.push((metadata_dir.join(format!("{}.json", stem)), SidecarPattern::MetadataDirectory));
    }

    candidates
}

#[derive(Debug, Clone, Default)]
pub struct SidecarLocator;

impl SidecarLocator {
    pub fn new() -> Self {
        Self
    }

    pub fn locate(&self, source: &Path) -> SidecarLocation {
        for (path, pattern) in candidate_paths(source) {
            if path.is_file() {
                debug!("Sidecar for {} via {}: {}", source.display(), pattern.name(), path.display());
                return SidecarLocation {
                    found: true,
                    sidecar_path: Some(path),
                    pattern: Some(pattern),
                };
            }
        }
        SidecarLocation::missing()
    }

    /// Search every source of a stored file; the first source with a sidecar is primary
    pub fn locate_entry(&self, pair: &PairEntry) -> LocationEntry {
        let located: Vec<(&PathBuf, SidecarLocation)> = pair
            .sources
            .iter()
            .map(|source| (source, self.locate(source)))
            .collect();

        let candidates: Vec<PathBuf> = located
            .iter()
            .filter_map(|(_, loc)| loc.sidecar_path.clone())
            .collect();

        let primary = located.iter().find(|(_, loc)| loc.found);
        let (original_source, location) = match primary {
            Some((source, loc)) => ((*source).clone(), loc.clone()),
            None => (
                pair.primary_source().map(Path::to_path_buf).unwrap_or_default(),
                SidecarLocation::missing(),
            ),
        };

        LocationEntry {
            file_exists: original_source.exists(),
            original_source,
            metadata_file: location.sidecar_path,
            metadata_type: location.pattern.map(|p| p.kind().to_string()),
            pattern: location.pattern.map(|p| p.name().to_string()),
            found: location.found,
            candidates,
        }
    }
}

/// Locate sidecars for all ingested files
pub fn locate_all(
    pairs: &[PairEntry],
    workers: usize,
    progress: Progress<'_>,
) -> Result<BTreeMap<String, LocationEntry>> {
    let locator = SidecarLocator::new();
    let entries = parallel_map(pairs, |pair| locator.locate_entry(pair), workers, progress)?;

    let locations: BTreeMap<String, LocationEntry> = pairs
        .iter()
        .map(|pair| pair.filename.clone())
        .zip(entries)
        .collect();

    let found = locations.values().filter(|l| l.found).count();
    let missing_sources = locations.values().filter(|l| !l.file_exists).count();
    info!("Sidecar search complete: {} found, {} not found", found, locations.len() - found);
    if missing_sources > 0 {
        warn!("{} original source files no longer exist", missing_sources);
    }
    Ok(locations)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TakeoutSidecar {
    photo_taken_time: Option<TakenTime>,
    geo_data: Option<GeoData>,
    geo_data_exif: Option<GeoData>,
}

#[derive(Debug, Default, Deserialize)]
struct TakenTime {
    timestamp: Option<JsonValue>,
    formatted: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeoData {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    altitude: Option<f64>,
}

impl GeoData {
    fn to_coord(&self) -> Option<GpsCoord> {
        if self.latitude == 0.0 && self.longitude == 0.0 {
            return None;
        }
        Some(GpsCoord::new(self.latitude, self.longitude, self.altitude))
    }
}

impl TakenTime {
    fn utc(&self) -> Option<NaiveDateTime> {
        let epoch = self.timestamp.as_ref().and_then(|ts| match ts {
            JsonValue::String(s) => s.trim().parse::<i64>().ok(),
            JsonValue::Number(n) => n.as_i64(),
            _ => None,
        });
        if let Some(secs) = epoch {
            if let Some(dt) = DateTime::from_timestamp(secs, 0) {
                return Some(dt.naive_utc());
            }
        }
        self.formatted.as_deref().and_then(parse_formatted_utc)
    }
}

/// Parse `2018/11/12 3:42:35 UTC` or `Nov 12, 2018, 3:42:35 AM UTC`
pub fn parse_formatted_utc(formatted: &str) -> Option<NaiveDateTime> {
    let cleaned = formatted.replace('\u{202f}', " ");
    let cleaned = cleaned.trim().trim_end_matches("UTC").trim();

    ["%Y/%m/%d %H:%M:%S", "%b %d, %Y, %I:%M:%S %p"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cleaned, fmt).ok())
}

/// Sidecar content as capture time (shifted to local time) and location
pub fn parse_sidecar(json: &str, utc_offset_hours: i32) -> Result<PhotoMetadata> {
    let sidecar: TakeoutSidecar = serde_json::from_str(json).context("Invalid sidecar JSON")?;

    let datetime = sidecar
        .photo_taken_time
        .as_ref()
        .and_then(TakenTime::utc)
        .map(|utc| utc + Duration::hours(utc_offset_hours as i64));

    let gps = sidecar
        .geo_data
        .as_ref()
        .and_then(GeoData::to_coord)
        .or_else(|| sidecar.geo_data_exif.as_ref().and_then(GeoData::to_coord));

    Ok(PhotoMetadata::sidecar(datetime, gps))
}

pub fn read_sidecar(path: &Path, utc_offset_hours: i32) -> Result<PhotoMetadata> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sidecar {}", path.display()))?;
    parse_sidecar(&json, utc_offset_hours)
        .with_context(|| format!("Failed to parse sidecar {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"{}").unwrap();
    }

    #[test]
    fn exact_supplemental_name_beats_other_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("IMG_0001.jpg");
        touch(&source);
        touch(&dir.path().join("IMG_0001.jpg.json"));
        touch(&dir.path().join("IMG_0001.jpg.supplemental-metadata.json"));

        let loc = SidecarLocator::new().locate(&source);
        assert!(loc.found);
        assert_eq!(loc.pattern, Some(SidecarPattern::Supplemental));
        assert_eq!(
            loc.sidecar_path.unwrap(),
            dir.path().join("IMG_0001.jpg.supplemental-metadata.json")
        );
    }

    #[test]
    fn truncated_and_numbered_variants() {
        let dir = tempfile::tempdir().unwrap();
        let long = dir.path().join("PXL_20230101_123456789.NIGHT.jpg");
        touch(&dir.path().join("PXL_20230101_123456789.NIGHT.jpg.supplemental-me.json"));
        let loc = SidecarLocator::new().locate(&long);
        assert_eq!(loc.pattern, Some(SidecarPattern::SupplementalTruncated));

        let dup = dir.path().join("IMG(2).jpg");
        touch(&dir.path().join("IMG.jpg.supplemental-metadata(2).json"));
        let loc = SidecarLocator::new().locate(&dup);
        assert_eq!(loc.pattern, Some(SidecarPattern::SupplementalNumbered));
        assert_eq!(split_duplicate_counter("IMG(2).jpg"), Some(("IMG.jpg".into(), 2)));
        assert_eq!(split_duplicate_counter("IMG.jpg"), None);
    }

    #[test]
    fn directory_heuristic_is_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("album").join("a.png");
        touch(&source);
        touch(&dir.path().join("metadata").join("a.png.json"));

        let loc = SidecarLocator::new().locate(&source);
        assert_eq!(loc.pattern, Some(SidecarPattern::MetadataDirectory));
        assert_eq!(loc.pattern.unwrap().kind(), "directory");
    }

    #[test]
    fn stem_supplemental_and_alternate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("trip").join("beach.jpg");
        touch(&source);
        touch(&dir.path().join("trip").join("beach.supplemental-metadata.json"));
        touch(&dir.path().join("trip").join("photo-metadata").join("beach.jpg.json"));

        let loc = SidecarLocator::new().locate(&source);
        assert_eq!(loc.pattern, Some(SidecarPattern::StemSupplemental));

        fs::remove_file(dir.path().join("trip").join("beach.supplemental-metadata.json")).unwrap();
        let loc = SidecarLocator::new().locate(&source);
        assert_eq!(loc.pattern, Some(SidecarPattern::MetadataDirectory));
        assert_eq!(
            loc.sidecar_path.unwrap(),
            dir.path().join("trip").join("photo-metadata").join("beach.jpg.json")
        );

        let other = dir.path().join("trip").join("dune.png");
        touch(&dir.path().join("image-metadata").join("dune.json"));
        let loc = SidecarLocator::new().locate(&other);
        assert_eq!(
            loc.sidecar_path.unwrap(),
            dir.path().join("image-metadata").join("dune.json")
        );
    }

    #[test]
    fn no_match_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loc = SidecarLocator::new().locate(&dir.path().join("lonely.jpg"));
        assert_eq!(loc, SidecarLocation::missing());
    }

    #[test]
    fn locate_entry_prefers_first_source_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a").join("x.jpg");
        let b = dir.path().join("b").join("x.jpg");
        touch(&a);
        touch(&b);
        touch(&dir.path().join("b").join("x.jpg.supplemental-metadata.json"));

        let pair = PairEntry {
            sources: vec![a.clone(), b.clone()],
            destination: dir.path().join("store/h.jpg"),
            filename: "h.jpg".into(),
            hash: "h".into(),
        };
        let entry = SidecarLocator::new().locate_entry(&pair);
        assert!(entry.found);
        assert!(entry.file_exists);
        assert_eq!(entry.original_source, b);
        assert_eq!(entry.metadata_type.as_deref(), Some("file"));
        assert_eq!(entry.candidates.len(), 1);
    }

    #[test]
    fn takeout_formatted_time_is_shifted_to_local() {
        let json = r#"{
            "title": "IMG_0001.jpg",
            "photoTakenTime": {"formatted": "2018/11/12 3:42:35 UTC"},
            "geoData": {"latitude": 0.0, "longitude": 0.0, "altitude": 0.0},
            "geoDataExif": {"latitude": 35.6586, "longitude": 139.7454, "altitude": 40.0}
        }"#;
        let meta = parse_sidecar(json, 9).unwrap();
        let expected = NaiveDate::from_ymd_opt(2018, 11, 12).unwrap().and_hms_opt(12, 42, 35).unwrap();
        assert_eq!(meta.datetime, Some(expected));
        let gps = meta.gps.unwrap();
        assert_eq!(gps.latitude, 35.6586);
        assert_eq!(gps.altitude, Some(40.0));
    }

    #[test]
    fn epoch_timestamp_is_preferred() {
        let utc = NaiveDate::from_ymd_opt(2018, 11, 12).unwrap().and_hms_opt(3, 42, 35).unwrap();
        let epoch = utc.and_utc().timestamp();
        let json = format!(
            r#"{{"photoTakenTime": {{"timestamp": "{}", "formatted": "garbage"}}}}"#,
            epoch
        );
        let meta = parse_sidecar(&json, 0).unwrap();
        assert_eq!(meta.datetime, Some(utc));
        assert!(meta.gps.is_none());
    }

    #[test]
    fn newer_takeout_format_parses() {
        let parsed = parse_formatted_utc("Nov 12, 2018, 3:42:35\u{202f}AM UTC").unwrap();
        assert_eq!(
            parsed,
            NaiveDate::from_ymd_opt(2018, 11, 12).unwrap().and_hms_opt(3, 42, 35).unwrap()
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_sidecar("{not json", 9).is_err());
    }
}
