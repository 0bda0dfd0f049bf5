/**
 * Bounded parallel map used by every pipeline stage
 *
 * Scheduling lives here; stages only supply the per-item worker. Progress is
 * reported through a callback so the CLI can drive an indicatif bar without
 * the stages knowing about it.
 */

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Progress callback: `(completed, total)`
pub type Progress<'a> = &'a (dyn Fn(usize, usize) + Sync);

pub fn no_progress(_done: usize, _total: usize) {}

/// Worker count for stages dominated by external-process I/O
///
/// Oversubscribes the CPUs because workers mostly wait on exiftool.
pub fn worker_count(requested: Option<usize>) -> usize {
    match requested {
        Some(n) => n.max(1),
        None => (num_cpus::get() * 2).max(1),
    }
}

fn build_pool(max_concurrency: usize) -> Result<rayon::ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(max_concurrency.max(1))
        .thread_name(|i| format!("photo-restore-worker-{}", i))
        .build()
        .context("Failed to build worker pool")
}

/// Apply `worker` to every item on at most `max_concurrency` threads, keeping input order
pub fn parallel_map<T, R, F>(
    items: &[T],
    worker: F,
    max_concurrency: usize,
    progress: Progress<'_>,
) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let pool = build_pool(max_concurrency)?;
    let total = items.len();
    let done = AtomicUsize::new(0);

    let results = pool.install(|| {
        items
            .par_iter()
            .map(|item| {
                let result = worker(item);
                progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                result
            })
            .collect()
    });

    Ok(results)
}

/// Like [`parallel_map`], but the first error stops outstanding work and is returned
pub fn try_parallel_map<T, R, E, F>(
    items: &[T],
    worker: F,
    max_concurrency: usize,
    progress: Progress<'_>,
) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    E: Into<anyhow::Error> + Send,
    F: Fn(&T) -> std::result::Result<R, E> + Sync,
{
    let pool = build_pool(max_concurrency)?;
    let total = items.len();
    let done = AtomicUsize::new(0);

    let results: std::result::Result<Vec<R>, E> = pool.install(|| {
        items
            .par_iter()
            .map(|item| {
                let result = worker(item);
                progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                result
            })
            .collect()
    });

    results.map_err(Into::into)
}

/// Progress bar in the house style; `progress_callback` adapts it for [`parallel_map`]
pub fn progress_bar(len: usize, message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1} files/s) ETA: {eta} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message);
    if len > 0 {
        info!("{} ({} items)", message, len);
    }
    pb
}

pub fn progress_callback(pb: &ProgressBar) -> impl Fn(usize, usize) + Sync + '_ {
    move |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn keeps_input_order() {
        let items: Vec<u32> = (0..200).collect();
        let out = parallel_map(&items, |n| n * 2, 4, &no_progress).unwrap();
        assert_eq!(out, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn reports_every_completion() {
        let items: Vec<u32> = (0..50).collect();
        let seen = Mutex::new(Vec::new());
        let record = |done: usize, total: usize| {
            assert_eq!(total, 50);
            seen.lock().unwrap().push(done);
        };
        parallel_map(&items, |n| *n, 3, &record).unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn try_map_surfaces_the_error() {
        let items: Vec<u32> = (0..20).collect();
        let result = try_parallel_map(
            &items,
            |n| if *n == 7 { Err(anyhow::anyhow!("boom at {}", n)) } else { Ok(*n) },
            2,
            &no_progress,
        );
        assert!(result.unwrap_err().to_string().contains("boom at 7"));
    }

    #[test]
    fn worker_count_never_zero() {
        assert_eq!(worker_count(Some(0)), 1);
        assert_eq!(worker_count(Some(6)), 6);
        assert!(worker_count(None) >= 1);
    }
}
