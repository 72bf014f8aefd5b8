//! Per-job shard log.
//!
//! Each render job can also record its entry as `<shards>/<image_id>.json`.
//! Shards are independent files, so any number of processes can write them
//! without coordination; [`compact`] later folds them into the manifest.

use std::path::{Path, PathBuf};

use synthblend_core::annotation::Category;

use crate::atomic::write_atomic;
use crate::error::DatasetError;
use crate::manifest::{self, DatasetEntry};

const SHARD_EXTENSION: &str = "json";

/// Directory of pending shard files.
#[derive(Debug, Clone)]
pub struct ShardLog {
    dir: PathBuf,
}

impl ShardLog {
    /// Open (creating if needed) the shard directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, DatasetError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(DatasetError::io(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn shard_path(&self, image_id: &str) -> PathBuf {
        self.dir.join(format!("{image_id}.{SHARD_EXTENSION}"))
    }

    /// Atomically write `entry` as its own shard and return the shard path.
    pub async fn write(&self, entry: &DatasetEntry) -> Result<PathBuf, DatasetError> {
        let path = self.shard_path(&entry.image.id);
        let bytes = serde_json::to_vec(entry).map_err(|source| DatasetError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    /// Remove the shard for `image_id`, if present.
    pub async fn remove(&self, image_id: &str) -> Result<(), DatasetError> {
        let path = self.shard_path(image_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DatasetError::io(path)(e)),
        }
    }

    /// Shard files waiting to be compacted, sorted by name.
    pub async fn pending(&self) -> Result<Vec<PathBuf>, DatasetError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(DatasetError::io(&self.dir))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(DatasetError::io(&self.dir))?
        {
            let path = entry.path();
            let is_shard = path.extension().is_some_and(|e| e == SHARD_EXTENSION)
                && path
                    .file_name()
                    .is_some_and(|n| !n.to_string_lossy().starts_with('.'));
            if is_shard {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Outcome of one [`compact`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Shards whose entry was added to the manifest.
    pub merged: usize,
    /// Shards whose image was already in the manifest.
    pub skipped: usize,
    /// Shards that could not be parsed. They are left in place.
    pub invalid: usize,
}

/// Fold every pending shard in `shard_dir` into the manifest at
/// `manifest_path`, then delete the shards that were folded in.
///
/// Must not run concurrently with a live accumulator on the same manifest.
/// Running it twice is harmless.
pub async fn compact(
    shard_dir: &Path,
    manifest_path: &Path,
    categories: Vec<Category>,
) -> Result<CompactionReport, DatasetError> {
    let mut report = CompactionReport::default();
    if !tokio::fs::try_exists(shard_dir)
        .await
        .map_err(DatasetError::io(shard_dir))?
    {
        return Ok(report);
    }

    let log = ShardLog::open(shard_dir).await?;
    let pending = log.pending().await?;
    if pending.is_empty() {
        return Ok(report);
    }

    let mut dataset = manifest::load_or_create(manifest_path, categories).await?;
    let mut consumed = Vec::with_capacity(pending.len());

    for path in pending {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(DatasetError::io(&path))?;
        let entry: DatasetEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable shard");
                report.invalid += 1;
                continue;
            }
        };
        if dataset.contains_image(&entry.image.id) {
            report.skipped += 1;
        } else {
            dataset.append(entry)?;
            report.merged += 1;
        }
        consumed.push(path);
    }

    if report.merged > 0 {
        dataset.sort();
        manifest::persist(&dataset, manifest_path).await?;
    }
    for path in consumed {
        tokio::fs::remove_file(&path)
            .await
            .map_err(DatasetError::io(&path))?;
    }

    tracing::info!(
        manifest = %manifest_path.display(),
        merged = report.merged,
        skipped = report.skipped,
        invalid = report.invalid,
        "Compacted shard log",
    );
    Ok(report)
}
