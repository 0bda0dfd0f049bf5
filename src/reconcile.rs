/**
 * Metadata reconciliation: merges embedded and sidecar metadata with conflict detection
 */

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::extract::SidecarReading;
use crate::metadata::{GpsCoord, MetadataSource, PhotoMetadata};

/// How far two readings of the same field may drift and still count as one value
///
/// Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub time_seconds: i64,
    pub gps_degrees: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            time_seconds: 60,
            gps_degrees: 0.0001,
        }
    }
}

impl Tolerance {
    pub fn datetimes_match(&self, a: NaiveDateTime, b: NaiveDateTime) -> bool {
        (a - b).num_seconds().abs() <= self.time_seconds
    }

    /// Latitude and longitude are compared independently; altitude is ignored
    pub fn gps_match(&self, a: &GpsCoord, b: &GpsCoord) -> bool {
        self.degrees_within(a.latitude, b.latitude) && self.degrees_within(a.longitude, b.longitude)
    }

    fn degrees_within(&self, a: f64, b: f64) -> bool {
        // Decimal degrees rarely subtract exactly; allow rounding noise at the boundary
        (a - b).abs() <= self.gps_degrees * (1.0 + 1e-9)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldClass {
    BothAgree,
    StoredOnly,
    SidecarOnly,
    Neither,
    Conflicted,
}

impl FieldClass {
    pub const ALL: [FieldClass; 5] = [
        FieldClass::BothAgree,
        FieldClass::StoredOnly,
        FieldClass::SidecarOnly,
        FieldClass::Neither,
        FieldClass::Conflicted,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            FieldClass::BothAgree => "Both (agree)",
            FieldClass::StoredOnly => "Stored copy only",
            FieldClass::SidecarOnly => "Sidecar only",
            FieldClass::Neither => "Neither",
            FieldClass::Conflicted => "Conflicted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Datetime,
    Gps,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Datetime => write!(f, "datetime"),
            Field::Gps => write!(f, "gps"),
        }
    }
}

/// Two readings of one field that disagree beyond the tolerance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub field: Field,
    pub between: String,
    pub first: String,
    pub second: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} differs between {}: {} vs {}", self.field, self.between, self.first, self.second)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRecord {
    pub filename: String,
    /// Authoritative values; a conflicted field is left empty
    pub metadata: PhotoMetadata,
    pub embedded: PhotoMetadata,
    pub sidecar: Option<PhotoMetadata>,
    #[serde(default)]
    pub sidecar_files: Vec<PathBuf>,
    pub datetime_class: FieldClass,
    pub gps_class: FieldClass,
    pub conflicted: bool,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

/// Several sidecars for one stored file folded into one reading
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarMerge {
    pub metadata: Option<PhotoMetadata>,
    pub conflicts: Vec<Conflict>,
}

fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn sidecar_name(reading: &SidecarReading) -> String {
    reading
        .sidecar_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| reading.sidecar_path.display().to_string())
}

/// Merge the sidecars of every duplicate source of one content hash
///
/// The first reading that has a field sets it. Every reading of that field
/// must agree with every other one within `tolerance`; each reading that
/// disagrees with an earlier one adds one conflict.
pub fn merge_sidecars(readings: &[SidecarReading], tolerance: &Tolerance) -> SidecarMerge {
    if readings.is_empty() {
        return SidecarMerge { metadata: None, conflicts: Vec::new() };
    }

    let mut conflicts = Vec::new();
    let mut datetimes: Vec<(NaiveDateTime, &SidecarReading)> = Vec::new();
    let mut coords: Vec<(GpsCoord, &SidecarReading)> = Vec::new();

    for reading in readings {
        if let Some(dt) = reading.metadata.datetime {
            if let Some((seen, origin)) = datetimes.iter().find(|(seen, _)| !tolerance.datetimes_match(*seen, dt)) {
                conflicts.push(Conflict {
                    field: Field::Datetime,
                    between: format!("sidecars {} and {}", sidecar_name(origin), sidecar_name(reading)),
                    first: format_datetime(seen),
                    second: format_datetime(&dt),
                });
            }
            datetimes.push((dt, reading));
        }
        if let Some(coord) = reading.metadata.gps {
            if let Some((seen, origin)) = coords.iter().find(|(seen, _)| !tolerance.gps_match(seen, &coord)) {
                conflicts.push(Conflict {
                    field: Field::Gps,
                    between: format!("sidecars {} and {}", sidecar_name(origin), sidecar_name(reading)),
                    first: seen.to_string(),
                    second: coord.to_string(),
                });
            }
            coords.push((coord, reading));
        }
    }

    SidecarMerge {
        metadata: Some(PhotoMetadata::sidecar(
            datetimes.first().map(|(dt, _)| *dt),
            coords.first().map(|(c, _)| *c),
        )),
        conflicts,
    }
}

/// Classify one field given its stored and sidecar values
///
/// Returns the class and the value to keep, taking the stored copy's value when both agree.
fn classify<T: Copy>(
    stored: Option<T>,
    sidecar: Option<T>,
    agree: impl Fn(&T, &T) -> bool,
) -> (FieldClass, Option<(T, MetadataSource)>) {
    match (stored, sidecar) {
        (Some(s), Some(c)) if agree(&s, &c) => (FieldClass::BothAgree, Some((s, MetadataSource::EmbeddedExif))),
        (Some(_), Some(_)) => (FieldClass::Conflicted, None),
        (Some(s), None) => (FieldClass::StoredOnly, Some((s, MetadataSource::EmbeddedExif))),
        (None, Some(c)) => (FieldClass::SidecarOnly, Some((c, MetadataSource::SidecarJson))),
        (None, None) => (FieldClass::Neither, None),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    tolerance: Tolerance,
}

impl Reconciler {
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    pub fn reconcile_one(
        &self,
        filename: &str,
        embedded: &PhotoMetadata,
        sidecars: &[SidecarReading],
    ) -> ReconciledRecord {
        let merged = merge_sidecars(sidecars, &self.tolerance);
        let mut conflicts = merged.conflicts;
        let sidecar = merged.metadata;
        let sidecar_dt = sidecar.as_ref().and_then(|m| m.datetime);
        let sidecar_gps = sidecar.as_ref().and_then(|m| m.gps);

        let (mut datetime_class, datetime) = classify(embedded.datetime, sidecar_dt, |a, b| {
            self.tolerance.datetimes_match(*a, *b)
        });
        if datetime_class == FieldClass::Conflicted {
            if let (Some(s), Some(c)) = (embedded.datetime, sidecar_dt) {
                conflicts.push(Conflict {
                    field: Field::Datetime,
                    between: "stored copy and sidecar".to_string(),
                    first: format_datetime(&s),
                    second: format_datetime(&c),
                });
            }
        }

        let (mut gps_class, gps) = classify(embedded.gps, sidecar_gps, |a, b| self.tolerance.gps_match(a, b));
        if gps_class == FieldClass::Conflicted {
            if let (Some(s), Some(c)) = (embedded.gps, sidecar_gps) {
                conflicts.push(Conflict {
                    field: Field::Gps,
                    between: "stored copy and sidecar".to_string(),
                    first: s.to_string(),
                    second: c.to_string(),
                });
            }
        }

        // Disagreement among the sidecars themselves poisons that field too
        if conflicts.iter().any(|c| c.field == Field::Datetime) {
            datetime_class = FieldClass::Conflicted;
        }
        if conflicts.iter().any(|c| c.field == Field::Gps) {
            gps_class = FieldClass::Conflicted;
        }

        let (datetime, datetime_source) = match datetime {
            Some((dt, src)) if datetime_class != FieldClass::Conflicted => (Some(dt), Some(src)),
            _ => (None, None),
        };
        let (gps, gps_source) = match gps {
            Some((coord, src)) if gps_class != FieldClass::Conflicted => (Some(coord), Some(src)),
            _ => (None, None),
        };

        for conflict in &conflicts {
            debug!("{}: {}", filename, conflict);
        }

        ReconciledRecord {
            filename: filename.to_string(),
            metadata: PhotoMetadata { datetime, datetime_source, gps, gps_source },
            embedded: embedded.clone(),
            sidecar,
            sidecar_files: sidecars.iter().map(|r| r.sidecar_path.clone()).collect(),
            datetime_class,
            gps_class,
            conflicted: !conflicts.is_empty(),
            conflicts,
        }
    }

    /// Reconcile every stored file that appears in either input
    pub fn reconcile(
        &self,
        embedded: &BTreeMap<String, PhotoMetadata>,
        sidecars: &BTreeMap<String, Vec<SidecarReading>>,
    ) -> BTreeMap<String, ReconciledRecord> {
        let filenames: BTreeSet<&String> = embedded.keys().chain(sidecars.keys()).collect();
        let empty = PhotoMetadata::default();

        let records: BTreeMap<String, ReconciledRecord> = filenames
            .into_iter()
            .map(|filename| {
                let stored = embedded.get(filename).unwrap_or(&empty);
                let readings = sidecars.get(filename).map(Vec::as_slice).unwrap_or(&[]);
                (filename.clone(), self.reconcile_one(filename, stored, readings))
            })
            .collect();

        let conflicted = records.values().filter(|r| r.conflicted).count();
        info!(
            "Reconciled {} records ({} conflicted, tolerance {}s / {} deg)",
            records.len(),
            conflicted,
            self.tolerance.time_seconds,
            self.tolerance.gps_degrees
        );
        if conflicted > 0 {
            warn!("{} records are conflicted; their disputed fields will not be written", conflicted);
        }
        records
    }
}
