/**
 * File operations module: content-addressed ingestion into the store
 */

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

use crate::artifacts::{PairEntry, QUARANTINE_DIR};
use crate::hashing::ContentHasher;
use crate::parallel::{parallel_map, Progress};

/// Copy through a temporary name so a half-written file never carries a final hash name
pub fn copy_into_store(source_path: &Path, target_path: &Path) -> Result<()> {
    debug!("Copying '{}' -> '{}'", source_path.display(), target_path.display());

    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create target directory: {}", parent.display()))?;
    }

    let tmp_path = target_path.with_extension("partial");
    fs::copy(source_path, &tmp_path)
        .with_context(|| format!("Failed to copy file from '{}' to '{}'",
            source_path.display(), tmp_path.display()))?;
    fs::rename(&tmp_path, target_path)
        .with_context(|| format!("Failed to move '{}' into place", target_path.display()))?;
    Ok(())
}

/// Move a file, falling back to copy+delete when rename is not possible
pub fn move_file(source_path: &Path, target_path: &Path) -> Result<()> {
    if !source_path.exists() {
        anyhow::bail!("Source file does not exist: {}", source_path.display());
    }
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create target directory: {}", parent.display()))?;
    }

    match fs::rename(source_path, target_path) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Rename failed ({}), using copy+delete strategy", e);
            fs::copy(source_path, target_path)
                .with_context(|| format!("Failed to copy file from '{}' to '{}'",
                    source_path.display(), target_path.display()))?;
            fs::remove_file(source_path)
                .with_context(|| format!("Failed to remove original file: {}", source_path.display()))
        }
    }
}

/// Lower-cased extension, repairing the `%jpg` style damage some exporters produce
pub fn file_extension(file_path: &Path) -> String {
    file_path.extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.trim_start_matches('%').to_lowercase())
        .unwrap_or_default()
}

/// The normalized extension when `file_path` is a recognized media file
pub fn classify_extension(file_path: &Path, extensions: &HashSet<String>) -> Option<String> {
    let ext = file_extension(file_path);
    extensions.contains(&ext).then_some(ext)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Copied,
    Duplicate,
    /// Already recorded by a previous run
    Resumed,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub total_files: usize,
    pub media_files: usize,
    pub copied: usize,
    pub duplicates: usize,
    pub resumed: usize,
    pub errors: usize,
    pub extension_counts: BTreeMap<String, usize>,
    pub unknown_extensions: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub pairs: Vec<PairEntry>,
    pub stats: IngestStats,
    pub failures: Vec<(PathBuf, String)>,
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug)]
struct Slot {
    entry: PairEntry,
    state: SlotState,
}

pub struct Ingestor {
    store: PathBuf,
    extensions: HashSet<String>,
    content_hasher: ContentHasher,
    workers: usize,
}

impl Ingestor {
    pub fn new(store: impl Into<PathBuf>, extensions: HashSet<String>, workers: usize) -> Self {
        Self {
            store: store.into(),
            extensions,
            content_hasher: ContentHasher::new(),
            workers,
        }
    }

    /// A stored copy counts as present in the store or in its quarantine
    fn already_stored(&self, filename: &str) -> bool {
        self.store.join(filename).exists() || self.store.join(QUARANTINE_DIR).join(filename).exists()
    }

    /// Regular files under `input`, symlinks skipped, sorted for stable output
    fn scan(&self, input: &Path, stats: &mut IngestStats) -> Result<Vec<PathBuf>> {
        if !input.is_dir() {
            anyhow::bail!("Input directory does not exist: {}", input.display());
        }

        // Never ingest our own store when it lives under the input tree,
        // however either path was spelled
        let canonical_input = fs::canonicalize(input)
            .with_context(|| format!("Failed to resolve input directory: {}", input.display()))?;
        let canonical_store = fs::canonicalize(&self.store)
            .with_context(|| format!("Failed to resolve store directory: {}", self.store.display()))?;

        let mut media = Vec::new();
        for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let resolved = match entry.path().strip_prefix(input) {
                Ok(relative) => canonical_input.join(relative),
                Err(_) => entry.path().to_path_buf(),
            };
            if resolved.starts_with(&canonical_store) {
                continue;
            }
            stats.total_files += 1;
            let ext = file_extension(entry.path());
            *stats.extension_counts.entry(ext.clone()).or_default() += 1;

            match classify_extension(entry.path(), &self.extensions) {
                Some(_) => media.push(entry.into_path()),
                None => *stats.unknown_extensions.entry(ext).or_default() += 1,
            }
        }

        media.sort();
        stats.media_files = media.len();
        Ok(media)
    }

    /// Hash and copy every media file under `input`
    ///
    /// `previous` is the pair list of an earlier run: its sources are not
    /// re-hashed and its entries are carried over.
    pub fn ingest(
        &self,
        input: &Path,
        previous: &[PairEntry],
        progress: Progress<'_>,
    ) -> Result<IngestOutcome> {
        fs::create_dir_all(&self.store)
            .with_context(|| format!("Failed to create store directory: {}", self.store.display()))?;

        let mut stats = IngestStats::default();
        let files = self.scan(input, &mut stats)?;
        info!(
            "Found {} media files ({} files total, {} with unrecognized extensions)",
            stats.media_files,
            stats.total_files,
            stats.total_files - stats.media_files
        );
        if !stats.unknown_extensions.is_empty() {
            info!(
                "Extensions not treated as media: {:?}",
                stats.unknown_extensions.keys().collect::<Vec<_>>()
            );
        }

        let mut seeded = HashMap::new();
        let mut known_sources = HashSet::new();
        for entry in previous {
            if !self.already_stored(&entry.filename) {
                warn!("Dropping checkpoint entry {}: stored copy is gone", entry.filename);
                continue;
            }
            known_sources.extend(entry.sources.iter().cloned());
            seeded.insert(entry.hash.clone(), Slot { entry: entry.clone(), state: SlotState::Ready });
        }
        let table = Mutex::new(seeded);

        let outcomes = parallel_map(
            &files,
            |path| {
                if known_sources.contains(path) {
                    return FileOutcome::Resumed;
                }
                match self.ingest_one(path, &table) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Failed to ingest {}: {:#}", path.display(), e);
                        FileOutcome::Failed(format!("{:#}", e))
                    }
                }
            },
            self.workers,
            progress,
        )?;

        let mut failures = Vec::new();
        for (path, outcome) in files.iter().zip(outcomes) {
            match outcome {
                FileOutcome::Copied => stats.copied += 1,
                FileOutcome::Duplicate => stats.duplicates += 1,
                FileOutcome::Resumed => stats.resumed += 1,
                FileOutcome::Failed(reason) => {
                    stats.errors += 1;
                    failures.push((path.clone(), reason));
                }
            }
        }

        let table = table.into_inner().map_err(|_| anyhow!("ingestion table lock poisoned"))?;
        let mut pairs = Vec::with_capacity(table.len());
        for (_, slot) in table {
            match slot.state {
                SlotState::Ready => {
                    let mut entry = slot.entry;
                    entry.sources.sort();
                    entry.sources.dedup();
                    pairs.push(entry);
                }
                SlotState::Failed | SlotState::Pending => {
                    // Duplicates that joined a failed copy are lost with it
                    for source in slot.entry.sources.iter().skip(1) {
                        stats.duplicates = stats.duplicates.saturating_sub(1);
                        stats.errors += 1;
                        failures.push((source.clone(), format!("copy of {} failed", slot.entry.hash)));
                    }
                }
            }
        }
        pairs.sort_by(|a, b| a.hash.cmp(&b.hash));

        info!(
            "Ingestion complete: {} stored, {} copied, {} duplicates folded, {} resumed, {} errors",
            pairs.len(), stats.copied, stats.duplicates, stats.resumed, stats.errors
        );

        Ok(IngestOutcome { pairs, stats, failures })
    }

    fn ingest_one(&self, path: &Path, table: &Mutex<HashMap<String, Slot>>) -> Result<FileOutcome> {
        let hash = self.content_hasher.calculate_file_hash(path)?;
        let filename = format!("{}.{}", hash, file_extension(path));
        let destination = self.store.join(&filename);

        {
            let mut table = table.lock().map_err(|_| anyhow!("ingestion table lock poisoned"))?;
            if let Some(slot) = table.get_mut(&hash) {
                debug!("Duplicate content {}: {}", hash, path.display());
                slot.entry.sources.push(path.to_path_buf());
                return Ok(FileOutcome::Duplicate);
            }
            table.insert(
                hash.clone(),
                Slot {
                    entry: PairEntry {
                        sources: vec![path.to_path_buf()],
                        destination: destination.clone(),
                        filename: filename.clone(),
                        hash: hash.clone(),
                    },
                    state: SlotState::Pending,
                },
            );
        }

        // Claimed under the lock; the copy itself runs unlocked
        let copied = if self.already_stored(&filename) {
            debug!("Stored copy already present: {}", destination.display());
            Ok(())
        } else {
            copy_into_store(path, &destination)
        };

        let mut table = table.lock().map_err(|_| anyhow!("ingestion table lock poisoned"))?;
        if let Some(slot) = table.get_mut(&hash) {
            slot.state = if copied.is_ok() { SlotState::Ready } else { SlotState::Failed };
        }
        copied.map(|()| FileOutcome::Copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::no_progress;

    fn media_exts() -> HashSet<String> {
        ["jpg", "jpeg", "png", "mp4"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extension_is_case_insensitive_and_repaired() {
        assert_eq!(file_extension(Path::new("a/B.JPG")), "jpg");
        assert_eq!(file_extension(Path::new("a/b.%jpeg")), "jpeg");
        assert_eq!(file_extension(Path::new("a/noext")), "");
        assert_eq!(classify_extension(Path::new("x.MP4"), &media_exts()), Some("mp4".to_string()));
        assert_eq!(classify_extension(Path::new("x.txt"), &media_exts()), None);
    }

    #[test]
    fn identical_files_share_one_stored_copy() {
        let input = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        fs::write(input.path().join("a.jpg"), b"same").unwrap();
        fs::create_dir(input.path().join("sub")).unwrap();
        fs::write(input.path().join("sub").join("b.JPG"), b"same").unwrap();
        fs::write(input.path().join("c.png"), b"different").unwrap();
        fs::write(input.path().join("notes.txt"), b"skip me").unwrap();

        let store = work.path().join("store");
        let ingestor = Ingestor::new(&store, media_exts(), 4);
        let outcome = ingestor.ingest(input.path(), &[], &no_progress).unwrap();

        assert_eq!(outcome.pairs.len(), 2);
        assert_eq!(outcome.stats.copied, 2);
        assert_eq!(outcome.stats.duplicates, 1);
        assert_eq!(outcome.stats.unknown_extensions.get("txt"), Some(&1));

        let shared = outcome.pairs.iter().find(|p| p.sources.len() == 2).unwrap();
        assert!(shared.sources.contains(&input.path().join("a.jpg")));
        assert!(shared.sources.contains(&input.path().join("sub").join("b.JPG")));
        assert!(shared.destination.exists());
        assert_eq!(shared.filename, format!("{}.jpg", shared.hash));

        let stored: Vec<_> = fs::read_dir(&store).unwrap().collect();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn many_duplicates_in_parallel_make_one_copy() {
        let input = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        for i in 0..40 {
            fs::write(input.path().join(format!("copy_{:02}.jpg", i)), b"burst").unwrap();
        }

        let store = work.path().join("store");
        let outcome = Ingestor::new(&store, media_exts(), 8)
            .ingest(input.path(), &[], &no_progress)
            .unwrap();

        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].sources.len(), 40);
        assert_eq!(outcome.stats.copied, 1);
        assert_eq!(outcome.stats.duplicates, 39);
        assert_eq!(fs::read_dir(&store).unwrap().count(), 1);
    }

    #[test]
    fn resume_skips_recorded_sources() {
        let input = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        fs::write(input.path().join("a.jpg"), b"one").unwrap();

        let store = work.path().join("store");
        let ingestor = Ingestor::new(&store, media_exts(), 2);
        let first = ingestor.ingest(input.path(), &[], &no_progress).unwrap();

        fs::write(input.path().join("b.jpg"), b"two").unwrap();
        let second = ingestor.ingest(input.path(), &first.pairs, &no_progress).unwrap();

        assert_eq!(second.stats.resumed, 1);
        assert_eq!(second.stats.copied, 1);
        assert_eq!(second.pairs.len(), 2);
    }

    #[test]
    fn store_inside_input_is_skipped_however_it_is_spelled() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.jpg"), b"only once").unwrap();
        fs::create_dir(root.path().join("work")).unwrap();

        // Same directory as root/store, reached through a detour
        let store = root.path().join("work").join("..").join("store");
        let ingestor = Ingestor::new(&store, media_exts(), 2);
        let first = ingestor.ingest(root.path(), &[], &no_progress).unwrap();
        assert_eq!(first.stats.copied, 1);
        assert!(root.path().join("store").join(&first.pairs[0].filename).exists());

        let second = ingestor.ingest(root.path(), &first.pairs, &no_progress).unwrap();
        assert_eq!(second.stats.media_files, 1);
        assert_eq!(second.pairs.len(), 1);
        assert_eq!(second.pairs[0].sources, vec![root.path().join("a.jpg")]);
    }

    #[test]
    fn missing_input_is_an_error() {
        let work = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(work.path().join("store"), media_exts(), 1);
        assert!(ingestor.ingest(&work.path().join("nope"), &[], &no_progress).is_err());
    }

    #[test]
    fn move_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.jpg");
        fs::write(&src, b"x").unwrap();
        let dst = dir.path().join("q").join("a.jpg");
        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert!(dst.exists());
    }
}
