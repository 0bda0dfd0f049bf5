/**
 * EXIF access through swappable backends
 *
 * Backends:
 * 1. exiftool subprocess (default, reads and writes)
 * 2. kamadak-exif (pure Rust, read-only, JPEG/TIFF/HEIF containers)
 * 3. in-memory map (tests and dry runs)
 *
 * All backends report tags keyed the way `exiftool -j -G` does
 * (`EXIF:DateTimeOriginal`, `Composite:GPSLatitude`, ...), so the parsing
 * below is shared.
 */

use chrono::NaiveDateTime;
use exif::{In, Reader as ExifReader, Tag, Value};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::error::ExifError;
use crate::metadata::{GpsCoord, PhotoMetadata};
use crate::retry::{call_with_retry, RetryPolicy};

pub type TagMap = BTreeMap<String, JsonValue>;

/// Outcome of reading one file
#[derive(Debug, Clone, PartialEq)]
pub enum ExifRead {
    Tags(TagMap),
    /// The tool answered but produced nothing usable for this file
    Empty { diagnostic: String },
}

pub trait ExifBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn read_tags(&self, path: &Path) -> Result<ExifRead, ExifError>;

    /// Write `tag=value` assignments in place
    fn write_tags(&self, path: &Path, assignments: &[(String, String)]) -> Result<(), ExifError>;
}

/// Priority list for capture time: original, then digitized/create, then modify
pub const DATETIME_TAGS: &[&str] = &[
    "EXIF:DateTimeOriginal",
    "XMP:DateTimeOriginal",
    "EXIF:CreateDate",
    "XMP:CreateDate",
    "QuickTime:CreateDate",
    "QuickTime:MediaCreateDate",
    "EXIF:ModifyDate",
    "XMP:ModifyDate",
    "QuickTime:ModifyDate",
];

/// Filesystem timestamps, only consulted when enabled
pub const FILESYSTEM_DATETIME_TAGS: &[&str] = &[
    "File:FileModifyDate",
    "File:FileAccessDate",
    "File:FileInodeChangeDate",
];

const LATITUDE_TAGS: &[(&str, &str)] = &[
    ("EXIF:GPSLatitude", "EXIF:GPSLatitudeRef"),
    ("Composite:GPSLatitude", "Composite:GPSLatitudeRef"),
    ("XMP:GPSLatitude", "XMP:GPSLatitudeRef"),
];

const LONGITUDE_TAGS: &[(&str, &str)] = &[
    ("EXIF:GPSLongitude", "EXIF:GPSLongitudeRef"),
    ("Composite:GPSLongitude", "Composite:GPSLongitudeRef"),
    ("XMP:GPSLongitude", "XMP:GPSLongitudeRef"),
];

const ALTITUDE_TAGS: &[(&str, &str)] = &[
    ("EXIF:GPSAltitude", "EXIF:GPSAltitudeRef"),
    ("Composite:GPSAltitude", "Composite:GPSAltitudeRef"),
    ("XMP:GPSAltitude", "XMP:GPSAltitudeRef"),
];

/// Turns backend tag maps into [`PhotoMetadata`]
#[derive(Debug, Clone, Default)]
pub struct ExifProcessor {
    use_filesystem_timestamps: bool,
}

impl ExifProcessor {
    pub fn new(use_filesystem_timestamps: bool) -> Self {
        Self { use_filesystem_timestamps }
    }

    pub fn metadata_from_tags(&self, tags: &TagMap) -> PhotoMetadata {
        PhotoMetadata::embedded(self.extract_datetime(tags), extract_gps(tags))
    }

    /// First present, non-empty, parseable value in priority order
    pub fn extract_datetime(&self, tags: &TagMap) -> Option<NaiveDateTime> {
        let fs_tags: &[&str] = if self.use_filesystem_timestamps {
            FILESYSTEM_DATETIME_TAGS
        } else {
            &[]
        };

        for tag in DATETIME_TAGS.iter().chain(fs_tags.iter()) {
            let Some(raw) = tags.get(*tag).and_then(json_as_string) else {
                continue;
            };
            if raw.trim().is_empty() || is_zero_timestamp(&raw) {
                continue;
            }
            match parse_exif_datetime(&raw) {
                Some(dt) => {
                    debug!("Using {} = {}", tag, raw);
                    return Some(dt);
                }
                None => debug!("Unparseable {} value: '{}'", tag, raw),
            }
        }
        None
    }
}

fn json_as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn is_zero_timestamp(timestamp_str: &str) -> bool {
    timestamp_str
        .chars()
        .filter(|c| c.is_ascii_digit())
        .all(|c| c == '0')
}

/// Parse `YYYY:MM:DD HH:MM:SS` or ISO forms, ignoring subseconds and zone suffixes
///
/// EXIF datetimes are wall-clock; a trailing `+09:00` or `Z` is dropped, not applied.
pub fn parse_exif_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let head = raw.get(..19)?;
    let normalized = head.replacen('T', " ", 1);

    ["%Y:%m:%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
}

fn dms_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*(\d+(?:\.\d+)?)\s*deg\s*(?:(\d+(?:\.\d+)?)\s*'\s*(?:(\d+(?:\.\d+)?)\s*")?)?\s*([NSEWnsew])?\s*$"#)
            .expect("static DMS pattern")
    })
}

fn altitude_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*(?:m\b)?\s*(.*)$").expect("static altitude pattern")
    })
}

fn is_negative_ref(reference: &str) -> bool {
    matches!(
        reference.trim().to_ascii_lowercase().as_str(),
        "s" | "south" | "w" | "west"
    )
}

/// Convert an exiftool coordinate (`35 deg 40' 12.34" N` or `35.67`) to signed decimal degrees
pub fn parse_gps_coordinate(value: &str, reference: Option<&str>) -> Option<f64> {
    let value = value.trim();

    let (magnitude, inline_ref) = if let Some(caps) = dms_regex().captures(value) {
        let part = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let decimal = part(1) + part(2) / 60.0 + part(3) / 3600.0;
        (decimal, caps.get(4).map(|m| m.as_str().to_string()))
    } else {
        let decimal = value.parse::<f64>().ok()?;
        if decimal < 0.0 {
            return Some(decimal);
        }
        (decimal, None)
    };

    let negative = inline_ref
        .as_deref()
        .or(reference)
        .map(is_negative_ref)
        .unwrap_or(false);

    Some(if negative { -magnitude } else { magnitude })
}

/// Parse `123.4 m`, `12 m Above Sea Level`, `5 m Below Sea Level`, or a bare number
pub fn parse_altitude(value: &str, reference: Option<&str>) -> Option<f64> {
    let caps = altitude_regex().captures(value)?;
    let magnitude: f64 = caps.get(1)?.as_str().parse().ok()?;
    let suffix = caps.get(2).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();

    let below = suffix.contains("below")
        || reference
            .map(|r| {
                let r = r.trim().to_ascii_lowercase();
                r == "1" || r.contains("below")
            })
            .unwrap_or(false);

    Some(if below { -magnitude.abs() } else { magnitude })
}

fn lookup_axis(tags: &TagMap, candidates: &[(&str, &str)]) -> Option<f64> {
    candidates.iter().find_map(|(tag, ref_tag)| {
        let value = tags.get(*tag).and_then(json_as_string)?;
        let reference = tags.get(*ref_tag).and_then(json_as_string);
        parse_gps_coordinate(&value, reference.as_deref())
    })
}

/// GPS needs both latitude and longitude; altitude is optional
pub fn extract_gps(tags: &TagMap) -> Option<GpsCoord> {
    let latitude = lookup_axis(tags, LATITUDE_TAGS)?;
    let longitude = lookup_axis(tags, LONGITUDE_TAGS)?;

    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        warn!("Ignoring out-of-range GPS reading {}, {}", latitude, longitude);
        return None;
    }

    let altitude = ALTITUDE_TAGS.iter().find_map(|(tag, ref_tag)| {
        let value = tags.get(*tag).and_then(json_as_string)?;
        let reference = tags.get(*ref_tag).and_then(json_as_string);
        parse_altitude(&value, reference.as_deref())
    });

    Some(GpsCoord::new(latitude, longitude, altitude))
}

/// exiftool invoked as one subprocess per call
#[derive(Debug)]
pub struct ExifTool {
    program: PathBuf,
    retry: RetryPolicy<ExifError>,
    version: String,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl ExifTool {
    /// Check that the binary runs and remember its version
    pub fn open(program: impl Into<PathBuf>, retry: RetryPolicy<ExifError>) -> Result<Self, ExifError> {
        let program = program.into();
        let output = call_with_retry(&retry, || run(&program, &["-ver".to_string()]))?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Using exiftool {} ({})", version, program.display());

        Ok(Self {
            program,
            retry,
            version,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// End of batch: log how much work went through this client
    pub fn close(self) {
        info!(
            "exiftool session closed: {} reads, {} writes",
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed)
        );
    }

    fn invoke(&self, args: Vec<String>) -> Result<Output, ExifError> {
        call_with_retry(&self.retry, || run(&self.program, &args))
    }
}

fn run(program: &Path, args: &[String]) -> Result<Output, ExifError> {
    Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ExifError::Spawn {
            program: program.display().to_string(),
            source,
        })
}

/// Parse `exiftool -j` stdout: an array with one object per file
pub fn parse_exiftool_json(path: &Path, stdout: &[u8], stderr: &str) -> Result<ExifRead, ExifError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(ExifRead::Empty {
            diagnostic: diagnostic_or(stderr, "exiftool printed nothing"),
        });
    }

    let parsed: Vec<TagMap> = serde_json::from_slice(stdout).map_err(|source| ExifError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let Some(mut tags) = parsed.into_iter().next() else {
        return Ok(ExifRead::Empty {
            diagnostic: diagnostic_or(stderr, "exiftool returned an empty list"),
        });
    };

    if let Some(error) = tags.get("ExifTool:Error").and_then(json_as_string) {
        return Ok(ExifRead::Empty { diagnostic: error });
    }

    tags.remove("SourceFile");
    Ok(ExifRead::Tags(tags))
}

fn diagnostic_or(stderr: &str, fallback: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() { fallback.to_string() } else { stderr.to_string() }
}

impl ExifBackend for ExifTool {
    fn name(&self) -> &'static str {
        "exiftool"
    }

    fn read_tags(&self, path: &Path) -> Result<ExifRead, ExifError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let output = self.invoke(vec![
            "-j".into(),
            "-G".into(),
            path.display().to_string(),
        ])?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_exiftool_json(path, &output.stdout, &stderr)
    }

    fn write_tags(&self, path: &Path, assignments: &[(String, String)]) -> Result<(), ExifError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut args = vec!["-overwrite_original".to_string(), "-P".to_string()];
        args.extend(assignments.iter().map(|(tag, value)| format!("-{}={}", tag, value)));
        args.push(path.display().to_string());

        let output = self.invoke(args)?;
        if !output.status.success() {
            return Err(ExifError::Failed {
                path: path.to_path_buf(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Read-only backend built on kamadak-exif
#[derive(Debug, Default)]
pub struct NativeReader;

impl NativeReader {
    pub fn new() -> Self {
        Self
    }

    fn ascii(exif: &exif::Exif, tag: Tag) -> Option<JsonValue> {
        match &exif.get_field(tag, In::PRIMARY)?.value {
            Value::Ascii(parts) => parts
                .first()
                .map(|bytes| JsonValue::String(String::from_utf8_lossy(bytes).trim().to_string())),
            _ => None,
        }
    }

    fn rational_triplet(exif: &exif::Exif, tag: Tag) -> Option<JsonValue> {
        match &exif.get_field(tag, In::PRIMARY)?.value {
            Value::Rational(parts) if parts.len() == 3 => {
                let decimal = parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;
                serde_json::Number::from_f64(decimal).map(JsonValue::Number)
            }
            _ => None,
        }
    }

    fn altitude(exif: &exif::Exif) -> Option<(JsonValue, Option<JsonValue>)> {
        let value = match &exif.get_field(Tag::GPSAltitude, In::PRIMARY)?.value {
            Value::Rational(parts) => serde_json::Number::from_f64(parts.first()?.to_f64())?,
            _ => return None,
        };
        let reference = match exif.get_field(Tag::GPSAltitudeRef, In::PRIMARY).map(|f| &f.value) {
            Some(Value::Byte(bytes)) => bytes.first().map(|b| JsonValue::String(b.to_string())),
            _ => None,
        };
        Some((JsonValue::Number(value), reference))
    }
}

impl ExifBackend for NativeReader {
    fn name(&self) -> &'static str {
        "native"
    }

    fn read_tags(&self, path: &Path) -> Result<ExifRead, ExifError> {
        let file = File::open(path).map_err(|source| ExifError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut bufreader = BufReader::new(&file);

        let exif = match ExifReader::new().read_from_container(&mut bufreader) {
            Ok(exif) => exif,
            // A valid container without an EXIF block simply has no tags
            Err(exif::Error::NotFound(_)) => return Ok(ExifRead::Tags(TagMap::new())),
            Err(e) => return Ok(ExifRead::Empty { diagnostic: e.to_string() }),
        };

        let mut tags = TagMap::new();
        let mut put = |name: &str, value: Option<JsonValue>| {
            if let Some(value) = value {
                tags.insert(name.to_string(), value);
            }
        };

        put("EXIF:DateTimeOriginal", Self::ascii(&exif, Tag::DateTimeOriginal));
        put("EXIF:CreateDate", Self::ascii(&exif, Tag::DateTimeDigitized));
        put("EXIF:ModifyDate", Self::ascii(&exif, Tag::DateTime));
        put("EXIF:GPSLatitude", Self::rational_triplet(&exif, Tag::GPSLatitude));
        put("EXIF:GPSLatitudeRef", Self::ascii(&exif, Tag::GPSLatitudeRef));
        put("EXIF:GPSLongitude", Self::rational_triplet(&exif, Tag::GPSLongitude));
        put("EXIF:GPSLongitudeRef", Self::ascii(&exif, Tag::GPSLongitudeRef));
        if let Some((altitude, reference)) = Self::altitude(&exif) {
            put("EXIF:GPSAltitude", Some(altitude));
            put("EXIF:GPSAltitudeRef", reference);
        }

        Ok(ExifRead::Tags(tags))
    }

    fn write_tags(&self, _path: &Path, _assignments: &[(String, String)]) -> Result<(), ExifError> {
        Err(ExifError::ReadOnly { backend: "native" })
    }
}

/// Tag store held in memory, keyed by file path
///
/// Files that exist on disk but were never seeded read as an empty tag set;
/// files marked unreadable (or missing on disk) read as [`ExifRead::Empty`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tags: Mutex<HashMap<PathBuf, TagMap>>,
    unreadable: Mutex<HashSet<PathBuf>>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, path: impl Into<PathBuf>, tags: &[(&str, &str)]) {
        let entry: TagMap = tags
            .iter()
            .map(|(k, v)| (k.to_string(), JsonValue::String(v.to_string())))
            .collect();
        if let Ok(mut map) = self.tags.lock() {
            map.entry(path.into()).or_default().extend(entry);
        }
    }

    pub fn mark_unreadable(&self, path: impl Into<PathBuf>) {
        if let Ok(mut set) = self.unreadable.lock() {
            set.insert(path.into());
        }
    }

    pub fn tags_for(&self, path: &Path) -> TagMap {
        self.tags
            .lock()
            .ok()
            .and_then(|map| map.get(path).cloned())
            .unwrap_or_default()
    }

    /// Move a path's tags along with a file move
    pub fn rename(&self, from: &Path, to: &Path) {
        if let Ok(mut map) = self.tags.lock() {
            if let Some(tags) = map.remove(from) {
                map.insert(to.to_path_buf(), tags);
            }
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl ExifBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read_tags(&self, path: &Path) -> Result<ExifRead, ExifError> {
        let unreadable = self
            .unreadable
            .lock()
            .map(|set| set.contains(path))
            .unwrap_or(false);
        if unreadable || !path.exists() {
            return Ok(ExifRead::Empty {
                diagnostic: format!("{}: file format error", path.display()),
            });
        }
        Ok(ExifRead::Tags(self.tags_for(path)))
    }

    fn write_tags(&self, path: &Path, assignments: &[(String, String)]) -> Result<(), ExifError> {
        if !path.exists() {
            return Err(ExifError::Failed {
                path: path.to_path_buf(),
                status: "exit status: 1".into(),
                stderr: "File not found".into(),
            });
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut map = self.tags.lock().map_err(|_| ExifError::Failed {
            path: path.to_path_buf(),
            status: "poisoned".into(),
            stderr: "memory backend lock poisoned".into(),
        })?;
        let entry = map.entry(path.to_path_buf()).or_default();
        for (tag, value) in assignments {
            entry.insert(tag.clone(), JsonValue::String(value.clone()));
        }
        Ok(())
    }
}
