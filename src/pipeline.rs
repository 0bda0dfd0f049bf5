/**
 * Stage orchestration over one working directory
 *
 * Each stage reads the previous stage's artifact from disk and writes its own,
 * so stages can be run one at a time or all together.
 */

use anyhow::{Context, Result};
use log::info;
use std::collections::BTreeMap;
use std::path::Path;

use crate::artifacts::{
    LocationEntry, PairEntry, WorkDir, LOCATION_FILE, PAIR_FILE, PHOTO_METADATA_FILE, RECONCILED_FILE,
    REPORT_FILE, SIDECAR_METADATA_FILE,
};
use crate::config::Config;
use crate::exif::ExifBackend;
use crate::exif_writer::{MetadataWriter, WriteSummary};
use crate::extract::{extract_embedded, extract_sidecars, ExtractOptions, SidecarReading, Side};
use crate::file_ops::{IngestOutcome, Ingestor};
use crate::metadata::PhotoMetadata;
use crate::parallel::{no_progress, progress_bar, progress_callback, worker_count, Progress};
use crate::reconcile::{ReconciledRecord, Reconciler};
use crate::report::SummaryReport;
use crate::sidecar::locate_all;

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub ingest: IngestOutcome,
    pub sidecars_found: usize,
    pub write: WriteSummary,
    pub report: SummaryReport,
}

pub struct Pipeline {
    config: Config,
    work: WorkDir,
    workers: usize,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(config: Config, work: WorkDir) -> Self {
        let workers = worker_count(config.workers);
        Self {
            config,
            work,
            workers,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn work(&self) -> &WorkDir {
        &self.work
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn with_bar<R>(&self, len: usize, message: &'static str, stage: impl FnOnce(Progress<'_>) -> Result<R>) -> Result<R> {
        if !self.show_progress {
            return stage(&no_progress);
        }
        let pb = progress_bar(len, message);
        let callback = progress_callback(&pb);
        let result = stage(&callback);
        pb.finish_with_message("done");
        result
    }

    fn pairs(&self) -> Result<Vec<PairEntry>> {
        self.work.load(PAIR_FILE, "ingest")
    }

    /// Hash and copy media from `input` into the store, resuming a previous `pair.json`
    pub fn ingest(&self, input: &Path) -> Result<IngestOutcome> {
        self.work.ensure_layout()?;
        let previous: Vec<PairEntry> = if self.work.artifact(PAIR_FILE).exists() {
            self.pairs()?
        } else {
            Vec::new()
        };
        if !previous.is_empty() {
            info!("Resuming from {} recorded entries", previous.len());
        }

        let ingestor = Ingestor::new(self.work.store(), self.config.media.extension_set(), self.workers);
        let outcome = self.with_bar(0, "Ingesting media", |progress| {
            ingestor.ingest(input, &previous, progress)
        })?;

        let path = self.work.save(PAIR_FILE, &outcome.pairs)?;
        info!("Wrote {}", path.display());
        Ok(outcome)
    }

    pub fn locate(&self) -> Result<BTreeMap<String, LocationEntry>> {
        let pairs = self.pairs()?;
        let locations = self.with_bar(pairs.len(), "Locating sidecars", |progress| {
            locate_all(&pairs, self.workers, progress)
        })?;
        self.work.save(LOCATION_FILE, &locations)?;
        Ok(locations)
    }

    pub fn extract(
        &self,
        backend: &dyn ExifBackend,
        side: Side,
    ) -> Result<(BTreeMap<String, PhotoMetadata>, BTreeMap<String, Vec<SidecarReading>>)> {
        let pairs = self.pairs()?;
        let locations: BTreeMap<String, LocationEntry> = self.work.load(LOCATION_FILE, "locate")?;

        let options = ExtractOptions {
            side,
            abort_on_missing: self.config.extract.abort_on_missing,
            use_filesystem_timestamps: self.config.extract.use_filesystem_timestamps,
            workers: self.workers,
        };
        let embedded = self.with_bar(pairs.len(), "Reading embedded EXIF", |progress| {
            extract_embedded(backend, &pairs, &self.work, &options, progress)
        })?;
        self.work.save(PHOTO_METADATA_FILE, &embedded)?;

        let sidecars = self.with_bar(locations.len(), "Reading sidecars", |progress| {
            extract_sidecars(&locations, self.config.sidecar.utc_offset_hours, self.workers, progress)
        })?;
        self.work.save(SIDECAR_METADATA_FILE, &sidecars)?;

        Ok((embedded, sidecars))
    }

    pub fn reconcile(&self) -> Result<BTreeMap<String, ReconciledRecord>> {
        let embedded: BTreeMap<String, PhotoMetadata> = self.work.load(PHOTO_METADATA_FILE, "extract")?;
        let sidecars: BTreeMap<String, Vec<SidecarReading>> = self.work.load(SIDECAR_METADATA_FILE, "extract")?;

        let records = Reconciler::new(self.config.tolerance).reconcile(&embedded, &sidecars);
        self.work.save(RECONCILED_FILE, &records)?;
        Ok(records)
    }

    pub fn write(&self, backend: &dyn ExifBackend) -> Result<WriteSummary> {
        let pairs = self.pairs()?;
        let records: BTreeMap<String, ReconciledRecord> = self.work.load(RECONCILED_FILE, "reconcile")?;

        let writer = MetadataWriter::new(backend, &self.work, self.config.media.video_set());
        self.with_bar(pairs.len(), "Writing metadata", |progress| {
            writer.write_all(&pairs, &records, self.workers, progress)
        })
    }

    pub fn report(&self) -> Result<SummaryReport> {
        let records: BTreeMap<String, ReconciledRecord> = self.work.load(RECONCILED_FILE, "reconcile")?;
        let report = SummaryReport::from_records(&records);
        let path = self.work.artifact(REPORT_FILE);
        std::fs::write(&path, report.render_markdown())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
        Ok(report)
    }

    /// Every stage in order
    pub fn run(&self, backend: &dyn ExifBackend, input: &Path, side: Side) -> Result<RunSummary> {
        let ingest = self.ingest(input)?;
        let locations = self.locate()?;
        self.extract(backend, side)?;
        self.reconcile()?;
        let write = self.write(backend)?;
        let report = self.report()?;

        Ok(RunSummary {
            ingest,
            sidecars_found: locations.values().filter(|l| l.found).count(),
            write,
            report,
        })
    }
}
