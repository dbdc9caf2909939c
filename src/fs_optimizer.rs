//! Batched filesystem operations over drop-zone directories
//!
//! The response and event drop-zones are flat directories of small JSON
//! files. Views over them stat, read, and delete in bounded-concurrency
//! batches; individual file errors are collected, never fatal to the batch,
//! because the external bridge may delete files while we scan.

use crate::error::Result;
use futures::StreamExt;
use futures::stream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Parallelism bound for batched stat/read/delete
fn batch_concurrency() -> usize {
    num_cpus::get().clamp(4, 16)
}

/// Metadata snapshot of one drop-zone file
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub path: PathBuf,
    pub len: u64,
    pub modified: SystemTime,
}

impl FileMeta {
    /// Whether the file was modified within `window` of `now`
    pub fn modified_within(&self, window: Duration, now: SystemTime) -> bool {
        now.duration_since(self.modified)
            .map(|age| age <= window)
            .unwrap_or(true) // clock skew: future mtimes count as fresh
    }

    /// Whether the file is older than `age` relative to `now`
    pub fn older_than(&self, age: Duration, now: SystemTime) -> bool {
        now.duration_since(self.modified)
            .map(|elapsed| elapsed > age)
            .unwrap_or(false)
    }
}

/// Outcome of a batched delete
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub deleted: usize,
    pub errors: Vec<(PathBuf, String)>,
}

/// Batched helpers over a drop-zone directory
#[derive(Debug, Clone, Default)]
pub struct FsOptimizer;

impl FsOptimizer {
    /// Creates the helper
    pub fn new() -> Self {
        Self
    }

    /// Lists `*.json` entries in `dir`; a missing directory yields an
    /// empty list
    pub async fn list_json_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Stats every path; unreadable entries are skipped
    pub async fn stat_batch(&self, paths: &[PathBuf]) -> Vec<FileMeta> {
        let metas: Vec<Option<FileMeta>> = stream::iter(paths.iter().cloned())
            .map(|path| async move {
                let meta = tokio::fs::metadata(&path).await.ok()?;
                let modified = meta.modified().ok()?;
                Some(FileMeta {
                    path,
                    len: meta.len(),
                    modified,
                })
            })
            .buffer_unordered(batch_concurrency())
            .collect()
            .await;
        metas.into_iter().flatten().collect()
    }

    /// Reads every path to a string; returns successes and skipped count
    pub async fn read_batch(&self, paths: &[PathBuf]) -> (Vec<(PathBuf, String)>, usize) {
        let results: Vec<Option<(PathBuf, String)>> = stream::iter(paths.iter().cloned())
            .map(|path| async move {
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => Some((path, content)),
                    Err(err) => {
                        debug!(path = %path.display(), %err, "skipping unreadable file");
                        None
                    }
                }
            })
            .buffer_unordered(batch_concurrency())
            .collect()
            .await;

        let total = results.len();
        let read: Vec<_> = results.into_iter().flatten().collect();
        let skipped = total - read.len();
        (read, skipped)
    }

    /// Unlinks every path; per-file errors are collected, the batch always
    /// completes
    pub async fn delete_batch(&self, paths: &[PathBuf]) -> DeleteReport {
        let outcomes: Vec<std::result::Result<(), (PathBuf, String)>> =
            stream::iter(paths.iter().cloned())
                .map(|path| async move {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => Ok(()),
                        // racing the bridge's own GC is expected
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(err) => Err((path, err.to_string())),
                    }
                })
                .buffer_unordered(batch_concurrency())
                .collect()
                .await;

        let mut report = DeleteReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(()) => report.deleted += 1,
                Err(entry) => report.errors.push(entry),
            }
        }
        report
    }
}
