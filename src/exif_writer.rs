/**
 * EXIF Writer module - fills missing capture time and GPS tags in stored copies
 *
 * Writes go through an [`ExifBackend`] so the same policy runs against
 * exiftool or the in-memory backend:
 * - never overwrite a field the file already has
 * - never write a field whose sources disagree
 * - decimal GPS is written as degrees/minutes/seconds plus hemisphere refs
 * - files still lacking a datetime are moved to the quarantine directory
 * - every outcome is appended to the write log
 */

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::artifacts::{PairEntry, WorkDir};
use crate::exif::{ExifBackend, ExifProcessor, ExifRead};
use crate::file_ops::{file_extension, move_file};
use crate::metadata::{latitude_ref, longitude_ref, Dms, GpsCoord};
use crate::parallel::{try_parallel_map, Progress};
use crate::reconcile::{FieldClass, ReconciledRecord};

pub const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum WriteOutcome {
    Restored { tags: Vec<String> },
    AlreadyComplete,
    /// Moved out of the store; `tags` were written before the move
    Quarantined { tags: Vec<String> },
    AlreadyQuarantined,
    /// Left in the store for review; `tags` filled undisputed fields only
    Conflicted { tags: Vec<String> },
    Failed { reason: String },
}

impl WriteOutcome {
    pub fn wrote_anything(&self) -> bool {
        match self {
            WriteOutcome::Restored { tags }
            | WriteOutcome::Quarantined { tags }
            | WriteOutcome::Conflicted { tags } => !tags.is_empty(),
            _ => false,
        }
    }
}

/// One line of `write_log.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteLogEntry {
    pub filename: String,
    pub path: PathBuf,
    pub logged_at: String,
    #[serde(flatten)]
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub restored: usize,
    pub already_complete: usize,
    pub quarantined: usize,
    pub already_quarantined: usize,
    pub conflicted: usize,
    pub failed: usize,
}

impl WriteSummary {
    fn count(&mut self, outcome: &WriteOutcome) {
        match outcome {
            WriteOutcome::Restored { .. } => self.restored += 1,
            WriteOutcome::AlreadyComplete => self.already_complete += 1,
            WriteOutcome::Quarantined { .. } => self.quarantined += 1,
            WriteOutcome::AlreadyQuarantined => self.already_quarantined += 1,
            WriteOutcome::Conflicted { .. } => self.conflicted += 1,
            WriteOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.restored
            + self.already_complete
            + self.quarantined
            + self.already_quarantined
            + self.conflicted
            + self.failed
    }
}

/// Append-only JSON Lines log shared by the writer threads
struct WriteLog {
    file: Mutex<File>,
}

impl WriteLog {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open write log {}", path.display()))?;
        Ok(Self { file: Mutex::new(file) })
    }

    fn record(&self, entry: &WriteLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock().map_err(|_| anyhow!("write log lock poisoned"))?;
        file.write_all(&line).context("Failed to append to write log")?;
        file.flush().context("Failed to flush write log")
    }
}

/// Tag assignments that fill a missing capture time
pub fn datetime_assignments(datetime: &NaiveDateTime, is_video: bool) -> Vec<(String, String)> {
    let value = datetime.format(EXIF_DATETIME_FORMAT).to_string();
    let mut tags = vec![
        ("EXIF:DateTimeOriginal".to_string(), value.clone()),
        ("EXIF:CreateDate".to_string(), value.clone()),
    ];
    if is_video {
        tags.push(("QuickTime:CreateDate".to_string(), value));
    }
    tags
}

/// Tag assignments that fill a missing location
pub fn gps_assignments(gps: &GpsCoord) -> Vec<(String, String)> {
    let mut tags = vec![
        ("EXIF:GPSLatitude".to_string(), Dms::from_decimal(gps.latitude).to_string()),
        ("EXIF:GPSLatitudeRef".to_string(), latitude_ref(gps.latitude).to_string()),
        ("EXIF:GPSLongitude".to_string(), Dms::from_decimal(gps.longitude).to_string()),
        ("EXIF:GPSLongitudeRef".to_string(), longitude_ref(gps.longitude).to_string()),
    ];
    if let Some(altitude) = gps.altitude {
        let reference = if altitude < 0.0 { "Below Sea Level" } else { "Above Sea Level" };
        tags.push(("EXIF:GPSAltitude".to_string(), format!("{:.2}", altitude.abs())));
        tags.push(("EXIF:GPSAltitudeRef".to_string(), reference.to_string()));
    }
    tags
}

pub struct MetadataWriter<'a> {
    backend: &'a dyn ExifBackend,
    work: &'a WorkDir,
    video_extensions: HashSet<String>,
    // Gaps are judged on real EXIF tags only, never filesystem times
    processor: ExifProcessor,
}

impl<'a> MetadataWriter<'a> {
    pub fn new(backend: &'a dyn ExifBackend, work: &'a WorkDir, video_extensions: HashSet<String>) -> Self {
        Self {
            backend,
            work,
            video_extensions,
            processor: ExifProcessor::new(false),
        }
    }

    /// Decide and apply the write for one stored file
    pub fn write_one(&self, pair: &PairEntry, record: Option<&ReconciledRecord>) -> (PathBuf, WriteOutcome) {
        let quarantined = self.work.quarantined_path(&pair.filename);
        let path = self.work.current_path(pair);
        if path == quarantined {
            return (path, WriteOutcome::AlreadyQuarantined);
        }
        if !path.exists() {
            return (path, WriteOutcome::Failed { reason: "stored copy is missing".into() });
        }

        let Some(record) = record else {
            return (path, WriteOutcome::Failed { reason: "no reconciled record".into() });
        };
        let current = match self.backend.read_tags(&path) {
            Ok(ExifRead::Tags(tags)) => self.processor.metadata_from_tags(&tags),
            Ok(ExifRead::Empty { diagnostic }) => {
                return (path, WriteOutcome::Failed { reason: diagnostic });
            }
            Err(e) => return (path, WriteOutcome::Failed { reason: e.to_string() }),
        };

        // Only undisputed gaps are filled
        let mut assignments = Vec::new();
        let mut has_datetime = current.has_datetime();
        if !current.has_datetime() && record.datetime_class != FieldClass::Conflicted {
            if let Some(datetime) = &record.metadata.datetime {
                let is_video = self.video_extensions.contains(&file_extension(&path));
                assignments.extend(datetime_assignments(datetime, is_video));
                has_datetime = true;
            }
        }
        if !current.has_gps() && record.gps_class != FieldClass::Conflicted {
            if let Some(gps) = &record.metadata.gps {
                assignments.extend(gps_assignments(gps));
            }
        }

        let tags: Vec<String> = assignments.iter().map(|(tag, _)| tag.clone()).collect();
        if !assignments.is_empty() {
            debug!("Writing {:?} to {}", tags, path.display());
            if let Err(e) = self.backend.write_tags(&path, &assignments) {
                return (path, WriteOutcome::Failed { reason: e.to_string() });
            }
        }

        if !has_datetime {
            return match move_file(&path, &quarantined) {
                Ok(()) => {
                    info!("Quarantined {}: no capture time recoverable", pair.filename);
                    (quarantined, WriteOutcome::Quarantined { tags })
                }
                Err(e) => (path, WriteOutcome::Failed { reason: format!("{:#}", e) }),
            };
        }

        if record.conflicted {
            debug!("{} left in store with {} conflict(s)", pair.filename, record.conflicts.len());
            (path, WriteOutcome::Conflicted { tags })
        } else if tags.is_empty() {
            (path, WriteOutcome::AlreadyComplete)
        } else {
            (path, WriteOutcome::Restored { tags })
        }
    }

    /// Fill gaps in every stored file and log each outcome as it happens
    pub fn write_all(
        &self,
        pairs: &[PairEntry],
        records: &BTreeMap<String, ReconciledRecord>,
        workers: usize,
        progress: Progress<'_>,
    ) -> Result<WriteSummary> {
        self.work.ensure_layout()?;
        let log_path = self.work.artifact(crate::artifacts::WRITE_LOG_FILE);
        let log = WriteLog::open(&log_path)?;

        let outcomes = try_parallel_map(
            pairs,
            |pair| -> Result<WriteOutcome> {
                let (path, outcome) = self.write_one(pair, records.get(&pair.filename));
                if let WriteOutcome::Failed { reason } = &outcome {
                    warn!("Failed to write {}: {}", pair.filename, reason);
                }
                log.record(&WriteLogEntry {
                    filename: pair.filename.clone(),
                    path,
                    logged_at: Local::now().to_rfc3339(),
                    outcome: outcome.clone(),
                })?;
                Ok(outcome)
            },
            workers,
            progress,
        )?;

        let mut summary = WriteSummary::default();
        for outcome in &outcomes {
            summary.count(outcome);
        }
        info!(
            "Write complete: {} restored, {} already complete, {} quarantined ({} previously), {} conflicted, {} failed",
            summary.restored,
            summary.already_complete,
            summary.quarantined,
            summary.already_quarantined,
            summary.conflicted,
            summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exif::MemoryBackend;
    use crate::metadata::PhotoMetadata;
    use crate::parallel::no_progress;
    use crate::reconcile::Reconciler;
    use chrono::NaiveDate;
    use std::fs;

    fn setup(name: &str) -> (tempfile::TempDir, WorkDir, PairEntry) {
        let dir = tempfile::tempdir().unwrap();
        let work = WorkDir::new(dir.path());
        work.ensure_layout().unwrap();
        let pair = PairEntry {
            sources: vec![dir.path().join("in").join(name)],
            destination: work.stored_path(name),
            filename: name.to_string(),
            hash: name.split('.').next().unwrap().to_string(),
        };
        fs::write(&pair.destination, b"img").unwrap();
        (dir, work, pair)
    }

    fn record(filename: &str, embedded: PhotoMetadata, sidecar: PhotoMetadata) -> ReconciledRecord {
        let reading = crate::extract::SidecarReading {
            sidecar_path: PathBuf::from(format!("{}.json", filename)),
            metadata: sidecar,
        };
        Reconciler::default().reconcile_one(filename, &embedded, &[reading])
    }

    fn taken() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 11, 12).unwrap().and_hms_opt(21, 42, 35).unwrap()
    }

    #[test]
    fn gps_is_written_as_dms_with_refs() {
        let tags = gps_assignments(&GpsCoord::new(-33.8568, 151.2153, Some(-4.5)));
        let map: BTreeMap<_, _> = tags.into_iter().collect();
        assert_eq!(map["EXIF:GPSLatitude"], "33 deg 51' 24.48\"");
        assert_eq!(map["EXIF:GPSLatitudeRef"], "S");
        assert_eq!(map["EXIF:GPSLongitudeRef"], "E");
        assert_eq!(map["EXIF:GPSAltitude"], "4.50");
        assert_eq!(map["EXIF:GPSAltitudeRef"], "Below Sea Level");
    }

    #[test]
    fn fills_only_missing_fields() {
        let (_dir, work, pair) = setup("aa.jpg");
        let backend = MemoryBackend::new();
        backend.seed(&pair.destination, &[("EXIF:DateTimeOriginal", "2001:01:01 00:00:00")]);

        let rec = record(
            "aa.jpg",
            PhotoMetadata::embedded(Some(taken()), None),
            PhotoMetadata::sidecar(Some(taken()), Some(GpsCoord::new(35.0, 139.0, None))),
        );
        let writer = MetadataWriter::new(&backend, &work, HashSet::new());
        let (_, outcome) = writer.write_one(&pair, Some(&rec));

        let tags = backend.tags_for(&pair.destination);
        assert_eq!(tags["EXIF:DateTimeOriginal"], "2001:01:01 00:00:00");
        assert!(tags.contains_key("EXIF:GPSLatitude"));
        match outcome {
            WriteOutcome::Restored { tags } => assert!(tags.iter().all(|t| t.contains("GPS"))),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn conflicted_field_is_never_written() {
        let (_dir, work, pair) = setup("bb.jpg");
        let backend = MemoryBackend::new();
        backend.seed(&pair.destination, &[("EXIF:DateTimeOriginal", "2018:11:12 21:42:35")]);
        let rec = record(
            "bb.jpg",
            PhotoMetadata::embedded(Some(taken()), None),
            PhotoMetadata::sidecar(Some(taken() + chrono::Duration::minutes(10)), None),
        );
        let writer = MetadataWriter::new(&backend, &work, HashSet::new());
        let (path, outcome) = writer.write_one(&pair, Some(&rec));
        assert_eq!(outcome, WriteOutcome::Conflicted { tags: vec![] });
        assert_eq!(path, pair.destination);
        assert_eq!(backend.write_count(), 0);
    }

    #[test]
    fn gps_conflict_still_fills_undisputed_datetime() {
        let (_dir, work, pair) = setup("dd.jpg");
        let backend = MemoryBackend::new();
        backend.seed(
            &pair.destination,
            &[("EXIF:GPSLatitude", "50.0"), ("EXIF:GPSLongitude", "60.0")],
        );
        let rec = record(
            "dd.jpg",
            PhotoMetadata::embedded(None, Some(GpsCoord::new(50.0, 60.0, None))),
            PhotoMetadata::sidecar(Some(taken()), Some(GpsCoord::new(10.0, 20.0, None))),
        );
        assert!(rec.conflicted);

        let writer = MetadataWriter::new(&backend, &work, HashSet::new());
        let (path, outcome) = writer.write_one(&pair, Some(&rec));
        assert_eq!(path, pair.destination);
        match outcome {
            WriteOutcome::Conflicted { tags } => assert!(tags.iter().all(|t| !t.contains("GPS"))),
            other => panic!("unexpected outcome {:?}", other),
        }
        let tags = backend.tags_for(&pair.destination);
        assert_eq!(tags["EXIF:DateTimeOriginal"], "2018:11:12 21:42:35");
        assert_eq!(tags["EXIF:GPSLatitude"], "50.0");
    }

    #[test]
    fn conflicted_record_without_datetime_is_quarantined() {
        let (_dir, work, pair) = setup("ee.jpg");
        let backend = MemoryBackend::new();
        let rec = record(
            "ee.jpg",
            PhotoMetadata::embedded(None, Some(GpsCoord::new(50.0, 60.0, None))),
            PhotoMetadata::sidecar(None, Some(GpsCoord::new(10.0, 20.0, None))),
        );
        assert!(rec.conflicted);

        let writer = MetadataWriter::new(&backend, &work, HashSet::new());
        let (path, outcome) = writer.write_one(&pair, Some(&rec));
        assert_eq!(outcome, WriteOutcome::Quarantined { tags: vec![] });
        assert_eq!(path, work.quarantined_path("ee.jpg"));
        assert!(!pair.destination.exists());
        assert_eq!(backend.write_count(), 0);
    }

    #[test]
    fn videos_also_get_quicktime_create_date() {
        let tags = datetime_assignments(&taken(), true);
        assert!(tags.iter().any(|(t, v)| t == "QuickTime:CreateDate" && v == "2018:11:12 21:42:35"));
        assert_eq!(datetime_assignments(&taken(), false).len(), 2);
    }

    #[test]
    fn write_all_logs_and_quarantines() {
        let (_dir, work, pair) = setup("cc.jpg");
        let backend = MemoryBackend::new();
        let mut records = BTreeMap::new();
        records.insert(
            "cc.jpg".to_string(),
            Reconciler::default().reconcile_one("cc.jpg", &PhotoMetadata::default(), &[]),
        );

        let writer = MetadataWriter::new(&backend, &work, HashSet::new());
        let summary = writer.write_all(&[pair.clone()], &records, 2, &no_progress).unwrap();
        assert_eq!(summary.quarantined, 1);
        assert!(!pair.destination.exists());
        assert!(work.quarantined_path("cc.jpg").exists());

        let again = writer.write_all(&[pair], &records, 2, &no_progress).unwrap();
        assert_eq!(again.already_quarantined, 1);

        let log = fs::read_to_string(work.artifact(crate::artifacts::WRITE_LOG_FILE)).unwrap();
        let entries: Vec<WriteLogEntry> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, WriteOutcome::Quarantined { tags: vec![] });
        assert_eq!(entries[1].outcome, WriteOutcome::AlreadyQuarantined);
    }
}
