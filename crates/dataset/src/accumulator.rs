//! Single-writer accumulator for the shared COCO manifest.
//!
//! One task owns the in-memory [`CocoDataset`] and is the only writer of
//! the manifest file. Render jobs reach it through a bounded channel and
//! get an acknowledgement once their entry is durably persisted, so
//! concurrent jobs can never overwrite each other's contributions.

use std::path::PathBuf;

use synthblend_core::annotation::Category;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::DatasetError;
use crate::manifest::{self, CocoDataset, DatasetEntry, Fingerprint};

/// Maximum entries folded into one persist.
const MAX_BATCH: usize = 64;

/// Read-merge-write attempts before giving up with [`DatasetError::Conflict`].
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;

type Ack = oneshot::Sender<Result<(), DatasetError>>;

struct AppendRequest {
    entry: DatasetEntry,
    ack: Ack,
}

/// Cloneable sender side of the accumulator.
#[derive(Debug, Clone)]
pub struct AccumulatorHandle {
    tx: mpsc::Sender<AppendRequest>,
}

impl AccumulatorHandle {
    /// Queue `entry` and wait until it is persisted (or rejected).
    pub async fn submit(&self, entry: DatasetEntry) -> Result<(), DatasetError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(AppendRequest { entry, ack })
            .await
            .map_err(|_| DatasetError::AccumulatorClosed)?;
        done.await.map_err(|_| DatasetError::AccumulatorClosed)?
    }
}

/// Totals reported when the accumulator shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorReport {
    pub appended: usize,
    pub rejected: usize,
    /// Images in the manifest at shutdown, including earlier runs.
    pub total_images: usize,
}

/// Owner of the manifest file.
pub struct Accumulator {
    path: PathBuf,
    dataset: CocoDataset,
    /// Fingerprint of the file as this accumulator last wrote or read it.
    last_written: Option<Fingerprint>,
    report: AccumulatorReport,
}

impl Accumulator {
    /// Load (or create) the manifest at `path` and start the writer task.
    ///
    /// The task runs until every [`AccumulatorHandle`] is dropped, then
    /// returns its report.
    pub async fn spawn(
        path: impl Into<PathBuf>,
        categories: Vec<Category>,
        capacity: usize,
    ) -> Result<(AccumulatorHandle, JoinHandle<AccumulatorReport>), DatasetError> {
        let path = path.into();
        let dataset = manifest::load_or_create(&path, categories).await?;
        let last_written = manifest::fingerprint(&path).await?;
        let accumulator = Self {
            path,
            report: AccumulatorReport {
                total_images: dataset.images.len(),
                ..Default::default()
            },
            dataset,
            last_written,
        };

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(accumulator.run(rx));
        Ok((AccumulatorHandle { tx }, task))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<AppendRequest>) -> AccumulatorReport {
        tracing::info!(path = %self.path.display(), "Dataset accumulator started");

        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(req) => batch.push(req),
                    Err(_) => break,
                }
            }
            self.apply(batch).await;
        }

        self.report.total_images = self.dataset.images.len();
        tracing::info!(
            path = %self.path.display(),
            appended = self.report.appended,
            rejected = self.report.rejected,
            total_images = self.report.total_images,
            "Dataset accumulator stopped",
        );
        self.report
    }

    /// Append a batch, persist once, and acknowledge every request.
    async fn apply(&mut self, batch: Vec<AppendRequest>) {
        let snapshot = self.dataset.clone();
        let mut accepted: Vec<Ack> = Vec::with_capacity(batch.len());

        for AppendRequest { entry, ack } in batch {
            let image_id = entry.image.id.clone();
            match self.dataset.append(entry) {
                Ok(()) => accepted.push(ack),
                Err(e) => {
                    tracing::warn!(image_id = %image_id, error = %e, "Rejected dataset entry");
                    self.report.rejected += 1;
                    let _ = ack.send(Err(e));
                }
            }
        }
        if accepted.is_empty() {
            return;
        }

        match self.persist_checked().await {
            Ok(()) => {
                self.report.appended += accepted.len();
                tracing::debug!(
                    entries = accepted.len(),
                    total_images = self.dataset.images.len(),
                    "Persisted dataset manifest",
                );
                for ack in accepted {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to persist dataset manifest");
                self.dataset = snapshot;
                self.report.rejected += accepted.len();
                let message = e.to_string();
                for ack in accepted {
                    let _ = ack.send(Err(clone_error(&e, &message)));
                }
            }
        }
    }

    /// Persist, first folding in any changes another writer made to the
    /// file since we last touched it.
    async fn persist_checked(&mut self) -> Result<(), DatasetError> {
        for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
            let on_disk = manifest::fingerprint(&self.path).await?;
            if on_disk.is_some() && on_disk != self.last_written {
                tracing::warn!(
                    path = %self.path.display(),
                    attempt,
                    "Manifest changed on disk; re-reading before write",
                );
                let mut disk =
                    manifest::load_or_create(&self.path, self.dataset.categories.clone()).await?;
                disk.merge_from(&self.dataset);
                self.dataset = disk;
                self.last_written = on_disk;
            }

            self.last_written = manifest::persist(&self.dataset, &self.path).await?;

            // Someone may have replaced the file between our check and the rename.
            if self.dataset_is_on_disk().await? {
                return Ok(());
            }
        }
        Err(DatasetError::Conflict {
            attempts: MAX_CONFLICT_ATTEMPTS,
        })
    }

    async fn dataset_is_on_disk(&self) -> Result<bool, DatasetError> {
        Ok(manifest::fingerprint(&self.path).await? == self.last_written)
    }
}

/// `DatasetError` is not `Clone` (it wraps `io::Error`); each waiting job
/// gets an equivalent error.
fn clone_error(e: &DatasetError, message: &str) -> DatasetError {
    match e {
        DatasetError::Conflict { attempts } => DatasetError::Conflict {
            attempts: *attempts,
        },
        DatasetError::DuplicateImage(id) => DatasetError::DuplicateImage(id.clone()),
        DatasetError::AccumulatorClosed => DatasetError::AccumulatorClosed,
        DatasetError::InvalidLabel {
            path,
            line,
            message,
        } => DatasetError::InvalidLabel {
            path: path.clone(),
            line: *line,
            message: message.clone(),
        },
        DatasetError::Io { path, source } => DatasetError::Io {
            path: path.clone(),
            source: std::io::Error::new(source.kind(), message.to_string()),
        },
        DatasetError::Json { path, .. } => DatasetError::Io {
            path: path.clone(),
            source: std::io::Error::other(message.to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_helpers::entry;

    #[tokio::test]
    async fn submit_persists_before_ack() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coco.json");
        let (handle, task) = Accumulator::spawn(&path, vec![], 8).await.expect("spawn");

        handle.submit(entry("00000")).await.expect("submit");
        let on_disk = manifest::load_or_create(&path, vec![]).await.expect("load");
        assert_eq!(on_disk.images.len(), 1);

        drop(handle);
        let report = task.await.expect("join");
        assert_eq!(report.appended, 1);
        assert_eq!(report.total_images, 1);
    }

    #[tokio::test]
    async fn duplicate_is_rejected_without_losing_others() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coco.json");
        let (handle, task) = Accumulator::spawn(&path, vec![], 8).await.expect("spawn");

        handle.submit(entry("00001")).await.expect("first");
        assert_matches!(
            handle.submit(entry("00001")).await,
            Err(DatasetError::DuplicateImage(_))
        );
        handle.submit(entry("00002")).await.expect("second");

        drop(handle);
        let report = task.await.expect("join");
        assert_eq!(report.appended, 2);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn external_write_is_merged_not_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coco.json");
        let (handle, task) = Accumulator::spawn(&path, vec![], 8).await.expect("spawn");
        handle.submit(entry("00001")).await.expect("first");

        // Another writer replaces the file with its own entries.
        let mut foreign = CocoDataset::new(vec![]);
        foreign.append(entry("99998")).unwrap();
        foreign.append(entry("99999")).unwrap();
        let bytes = serde_json::to_vec(&foreign).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        handle.submit(entry("00002")).await.expect("second");
        drop(handle);
        task.await.expect("join");

        let mut ids: Vec<String> = manifest::load_or_create(&path, vec![])
            .await
            .expect("load")
            .images
            .into_iter()
            .map(|i| i.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["00001", "00002", "99998", "99999"]);
    }

    #[tokio::test]
    async fn closed_accumulator_reports_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, task) = Accumulator::spawn(dir.path().join("coco.json"), vec![], 1)
            .await
            .expect("spawn");
        task.abort();
        let _ = task.await;
        assert_matches!(
            handle.submit(entry("00000")).await,
            Err(DatasetError::AccumulatorClosed)
        );
    }

    #[tokio::test]
    async fn resumes_existing_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coco.json");
        let mut existing = CocoDataset::new(vec![]);
        existing.append(entry("00000")).unwrap();
        manifest::persist(&existing, &path).await.expect("persist");

        let (handle, task) = Accumulator::spawn(&path, vec![], 4).await.expect("spawn");
        handle.submit(entry("00001")).await.expect("submit");
        drop(handle);
        let report = task.await.expect("join");
        assert_eq!(report.appended, 1);
        assert_eq!(report.total_images, 2);
    }
}
