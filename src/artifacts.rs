/**
 * On-disk layout and the artifacts stages hand to each other
 */

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::StageError;

pub const STORE_DIR: &str = "store";
pub const QUARANTINE_DIR: &str = "no_datetime";
pub const PAIR_FILE: &str = "pair.json";
pub const LOCATION_FILE: &str = "metadata_location.json";
pub const PHOTO_METADATA_FILE: &str = "photo_metadata.json";
pub const SIDECAR_METADATA_FILE: &str = "sidecar_metadata.json";
pub const RECONCILED_FILE: &str = "reconciled_metadata.json";
pub const REPORT_FILE: &str = "report.md";
pub const WRITE_LOG_FILE: &str = "write_log.jsonl";

/// Paths inside one pipeline working directory
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> PathBuf {
        self.root.join(STORE_DIR)
    }

    pub fn quarantine(&self) -> PathBuf {
        self.store().join(QUARANTINE_DIR)
    }

    pub fn stored_path(&self, filename: &str) -> PathBuf {
        self.store().join(filename)
    }

    pub fn quarantined_path(&self, filename: &str) -> PathBuf {
        self.quarantine().join(filename)
    }

    /// Where a stored file lives now: the store, or quarantine after the writer moved it
    pub fn current_path(&self, pair: &PairEntry) -> PathBuf {
        if pair.destination.exists() {
            return pair.destination.clone();
        }
        let quarantined = self.quarantined_path(&pair.filename);
        if quarantined.exists() {
            quarantined
        } else {
            pair.destination.clone()
        }
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.quarantine())
            .with_context(|| format!("Failed to create store directory: {}", self.store().display()))
    }

    /// Load an artifact produced by `stage`, with a hint when it is absent
    pub fn load<T: DeserializeOwned>(&self, name: &str, stage: &'static str) -> Result<T> {
        let path = self.artifact(name);
        if !path.exists() {
            return Err(StageError::MissingArtifact { path, stage }.into());
        }
        load_json(&path)
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.artifact(name);
        save_json(&path, value)?;
        Ok(path)
    }
}

/// One distinct content hash and every source path that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairEntry {
    pub sources: Vec<PathBuf>,
    pub destination: PathBuf,
    pub filename: String,
    pub hash: String,
}

impl PairEntry {
    pub fn primary_source(&self) -> Option<&Path> {
        self.sources.first().map(PathBuf::as_path)
    }
}

/// Result of the sidecar search for one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEntry {
    pub original_source: PathBuf,
    pub metadata_file: Option<PathBuf>,
    pub metadata_type: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    pub found: bool,
    pub file_exists: bool,
    /// Sidecars found for the other duplicate sources of the same content
    #[serde(default)]
    pub candidates: Vec<PathBuf>,
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write pretty JSON through a temporary file so a crash never leaves a torn artifact
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)
            .with_context(|| format!("Failed to serialize {}", path.display()))?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))
}

/// Append one JSON value as a line
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line)
        .with_context(|| format!("Failed to append to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn pair_file_uses_documented_field_names() {
        let entry = PairEntry {
            sources: vec![PathBuf::from("in/a.jpg"), PathBuf::from("in/b.jpg")],
            destination: PathBuf::from("work/store/00ff.jpg"),
            filename: "00ff.jpg".into(),
            hash: "00ff".into(),
        };
        let json = serde_json::to_value(vec![entry]).unwrap();
        assert_eq!(json[0]["sources"][1], "in/b.jpg");
        assert_eq!(json[0]["destination"], "work/store/00ff.jpg");
        assert_eq!(json[0]["filename"], "00ff.jpg");
        assert_eq!(json[0]["hash"], "00ff");
    }

    #[test]
    fn missing_artifact_names_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let work = WorkDir::new(dir.path());
        let err = work.load::<Vec<PairEntry>>(PAIR_FILE, "ingest").unwrap_err();
        assert!(err.to_string().contains("'ingest'"));
    }

    #[test]
    fn current_path_follows_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let work = WorkDir::new(dir.path());
        work.ensure_layout().unwrap();
        let pair = PairEntry {
            sources: vec![],
            destination: work.stored_path("ab.jpg"),
            filename: "ab.jpg".into(),
            hash: "ab".into(),
        };
        assert_eq!(work.current_path(&pair), pair.destination);
        fs::write(work.quarantined_path("ab.jpg"), b"x").unwrap();
        assert_eq!(work.current_path(&pair), work.quarantined_path("ab.jpg"));
    }

    #[test]
    fn save_then_load_and_append_lines() {
        let dir = tempfile::tempdir().unwrap();
        let work = WorkDir::new(dir.path());
        let mut map = BTreeMap::new();
        map.insert("x.jpg".to_string(), 3u32);
        work.save("m.json", &map).unwrap();
        let back: BTreeMap<String, u32> = work.load("m.json", "test").unwrap();
        assert_eq!(back, map);
        assert!(!dir.path().join("m.json.tmp").exists());

        let log = work.artifact(WRITE_LOG_FILE);
        append_json_line(&log, &1).unwrap();
        append_json_line(&log, &2).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "1\n2\n");
    }
}
