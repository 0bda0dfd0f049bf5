use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::path::PathBuf;

use photo_restore::artifacts::WorkDir;
use photo_restore::exif::{ExifBackend, ExifTool, NativeReader};
use photo_restore::exif_writer::WriteSummary;
use photo_restore::extract::Side;
use photo_restore::file_ops::IngestOutcome;
use photo_restore::{Config, Pipeline};

#[derive(Parser)]
#[command(name = "photo-restore")]
#[command(version)]
#[command(about = "Restore capture time and GPS metadata for exported photo libraries")]
#[command(long_about = "Batch pipeline that restores missing EXIF capture time and GPS data.

Stages (each reads the previous stage's artifact from the working directory):
- ingest: hash media files and copy each distinct content to store/<hash>.<ext>
- locate: find the export tool's JSON sidecar for every source file
- extract: read embedded EXIF and sidecar metadata
- reconcile: merge both sources, flagging values that disagree
- write: fill missing EXIF tags in place; quarantine files with no capture time
- report: write report.md and print the summary
- run: all of the above in order")]
struct Cli {
    /// Increase verbosity (-v=INFO, -vv=DEBUG, -vvv=TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Pipeline working directory
    #[arg(short = 'd', long, default_value = ".", global = true)]
    work_dir: PathBuf,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Number of parallel workers (default: twice the CPU count)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Path to the exiftool binary
    #[arg(long, global = true)]
    exiftool: Option<PathBuf>,

    /// Metadata backend: exiftool, or the built-in read-only EXIF reader
    #[arg(long, value_enum, default_value = "exiftool", global = true)]
    backend: BackendKind,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Exiftool,
    Native,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every distinct media file from INPUT into the store
    Ingest {
        /// Directory tree to scan
        input: PathBuf,
    },
    /// Locate metadata sidecars for the ingested files
    Locate,
    /// Extract embedded EXIF and sidecar metadata
    Extract {
        /// Read EXIF from the original source files instead of the stored copies
        #[arg(long)]
        from_source: bool,
    },
    /// Reconcile embedded and sidecar metadata
    Reconcile,
    /// Write reconciled metadata into stored files that lack it
    Write,
    /// Write report.md and print the summary
    Report,
    /// Run every stage in order
    Run {
        /// Directory tree to scan
        input: PathBuf,
        /// Read EXIF from the original source files instead of the stored copies
        #[arg(long)]
        from_source: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    info!("Starting photo-restore");

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if cli.workers.is_some() {
        config.workers = cli.workers;
    }
    if let Some(exiftool) = &cli.exiftool {
        config.exiftool.path = exiftool.clone();
    }

    let pipeline = Pipeline::new(config.clone(), WorkDir::new(&cli.work_dir)).with_progress(!cli.no_progress);
    info!("Working directory: {} ({} workers)", cli.work_dir.display(), pipeline.workers());

    match &cli.command {
        Commands::Ingest { input } => {
            let outcome = pipeline.ingest(input)?;
            print_ingest_summary(&outcome);
        }
        Commands::Locate => {
            let locations = pipeline.locate()?;
            let found = locations.values().filter(|l| l.found).count();
            println!("\nSidecar search complete!");
            println!("Sidecars found: {}", found);
            println!("Not found: {}", locations.len() - found);
        }
        Commands::Extract { from_source } => {
            let (embedded, sidecars) = with_backend(&cli, &config, |backend| {
                pipeline.extract(backend, side(*from_source))
            })?;
            println!("\nExtraction complete!");
            println!("Files read: {}", embedded.len());
            println!("With embedded datetime: {}", embedded.values().filter(|m| m.has_datetime()).count());
            println!("With embedded GPS: {}", embedded.values().filter(|m| m.has_gps()).count());
            println!("Sidecars parsed: {}", sidecars.len());
        }
        Commands::Reconcile => {
            let records = pipeline.reconcile()?;
            println!("\nReconciliation complete!");
            println!("Records: {}", records.len());
            println!("Conflicted: {}", records.values().filter(|r| r.conflicted).count());
        }
        Commands::Write => {
            require_writable(cli.backend)?;
            let summary = with_backend(&cli, &config, |backend| pipeline.write(backend))?;
            print_write_summary(&summary);
        }
        Commands::Report => {
            pipeline.report()?.print_table();
        }
        Commands::Run { input, from_source } => {
            require_writable(cli.backend)?;
            let summary = with_backend(&cli, &config, |backend| {
                pipeline.run(backend, input, side(*from_source))
            })?;
            print_ingest_summary(&summary.ingest);
            println!("Sidecars found: {}", summary.sidecars_found);
            print_write_summary(&summary.write);
            summary.report.print_table();
        }
    }

    Ok(())
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    Ok(())
}

fn side(from_source: bool) -> Side {
    if from_source { Side::Source } else { Side::Stored }
}

fn require_writable(backend: BackendKind) -> Result<()> {
    if backend == BackendKind::Native {
        anyhow::bail!("The native backend is read-only; use --backend exiftool to write metadata");
    }
    Ok(())
}

/// Open the chosen backend for the duration of `stage`
fn with_backend<R>(cli: &Cli, config: &Config, stage: impl FnOnce(&dyn ExifBackend) -> Result<R>) -> Result<R> {
    match cli.backend {
        BackendKind::Exiftool => {
            let tool = ExifTool::open(&config.exiftool.path, config.exiftool.retry_policy())
                .with_context(|| format!("Failed to start exiftool ({})", config.exiftool.path.display()))?;
            let result = stage(&tool);
            tool.close();
            result
        }
        BackendKind::Native => stage(&NativeReader::new()),
    }
}

fn print_ingest_summary(outcome: &IngestOutcome) {
    let stats = &outcome.stats;
    println!("\nIngestion complete!");
    println!("Files scanned: {}", stats.total_files);
    println!("Media files: {}", stats.media_files);
    println!("Stored files: {}", outcome.pairs.len());
    println!("Copied: {}", stats.copied);
    println!("Duplicates: {}", stats.duplicates);
    println!("Resumed: {}", stats.resumed);
    println!("Errors: {}", stats.errors);

    if !stats.unknown_extensions.is_empty() {
        println!("\nSkipped extensions:");
        for (ext, count) in &stats.unknown_extensions {
            let ext = if ext.is_empty() { "(none)" } else { ext.as_str() };
            println!("  {}: {}", ext, count);
        }
    }

    if !outcome.failures.is_empty() {
        println!("\nErrors:");
        for (path, reason) in &outcome.failures {
            println!("  {}: {}", path.display(), reason);
        }
    }
}

fn print_write_summary(summary: &WriteSummary) {
    println!("\nWrite complete!");
    println!("Files processed: {}", summary.total());
    println!("Restored: {}", summary.restored);
    println!("Already complete: {}", summary.already_complete);
    println!("Quarantined: {}", summary.quarantined);
    println!("Previously quarantined: {}", summary.already_quarantined);
    println!("Conflicted (left for review): {}", summary.conflicted);
    println!("Errors: {}", summary.failed);
}
