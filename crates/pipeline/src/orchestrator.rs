//! Bounded fan-out of render and augmentation jobs.
//!
//! Jobs are independent; the only shared resource is the dataset
//! accumulator behind the render context's sink. A failed job is recorded
//! and the batch moves on. A fatal error (the renderer program is missing)
//! cancels the batch: jobs that have not finished rendering are skipped,
//! and whatever was already persisted stays valid.

use std::fmt;

use futures::stream::{self, StreamExt};
use synthblend_core::types::JobIndex;
use tokio_util::sync::CancellationToken;

use crate::augment::{AugmentJob, Augmenter};
use crate::render::{RenderContext, RenderedImage};
use crate::renderer::{RenderError, RenderOutput, RenderRequest, Renderer};

/// How one job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    Succeeded(T),
    /// Cancelled before it completed, or already in the dataset.
    Skipped,
    Failed { reason: String },
}

/// Per-batch job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchSummary {
    fn record<T>(&mut self, outcome: &JobOutcome<T>) {
        match outcome {
            JobOutcome::Succeeded(_) => self.succeeded += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} skipped, {} failed",
            self.succeeded, self.skipped, self.failed
        )
    }
}

/// Result of a render batch.
#[derive(Debug, Clone, Default)]
pub struct RenderBatch {
    pub summary: BatchSummary,
    /// Successful renders, in completion order.
    pub rendered: Vec<RenderedImage>,
}

/// Schedules jobs across a bounded number of concurrent workers.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Render every job in `jobs`, at most `n_workers` at a time.
    ///
    /// Each job gets up to `max_attempts` render attempts for retryable
    /// errors (timeouts, bad output). Failures never abort the batch.
    pub async fn run_renders<R: Renderer>(
        &self,
        ctx: &RenderContext,
        renderer: &R,
        jobs: impl IntoIterator<Item = JobIndex>,
        n_workers: usize,
        max_attempts: u32,
    ) -> RenderBatch {
        let n_workers = n_workers.max(1);
        tracing::info!(n_workers, max_attempts, "Render batch started");

        let outcomes: Vec<JobOutcome<RenderedImage>> = stream::iter(jobs)
            .map(move |job_index| self.render_one(ctx, renderer, job_index, max_attempts))
            .buffer_unordered(n_workers)
            .collect()
            .await;

        let mut batch = RenderBatch::default();
        for outcome in outcomes {
            batch.summary.record(&outcome);
            if let JobOutcome::Succeeded(image) = outcome {
                batch.rendered.push(image);
            }
        }
        tracing::info!(
            succeeded = batch.summary.succeeded,
            skipped = batch.summary.skipped,
            failed = batch.summary.failed,
            "Render batch finished",
        );
        batch
    }

    async fn render_one<R: Renderer>(
        &self,
        ctx: &RenderContext,
        renderer: &R,
        job_index: JobIndex,
        max_attempts: u32,
    ) -> JobOutcome<RenderedImage> {
        if self.cancel.is_cancelled() {
            return JobOutcome::Skipped;
        }
        if ctx.is_recorded(job_index) {
            tracing::info!(job_index, "Job already in the dataset manifest; not rendering");
            return JobOutcome::Skipped;
        }
        let request = ctx.request(job_index);

        // Only the render itself is cancellable; once an image exists its
        // annotation is always recorded.
        let rendered = tokio::select! {
            _ = self.cancel.cancelled() => return JobOutcome::Skipped,
            result = render_with_retry(renderer, &request, max_attempts) => result,
        };
        let result = match rendered {
            Ok(output) => ctx.export(&request, output).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(image) => {
                tracing::debug!(
                    job_index,
                    path = %image.image_path.display(),
                    degenerate = image.degenerate,
                    "Render job succeeded",
                );
                JobOutcome::Succeeded(image)
            }
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!(job_index, error = %e, "Fatal render error; cancelling batch");
                    self.cancel.cancel();
                } else {
                    tracing::error!(job_index, error = %e, "Render job failed");
                }
                JobOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Augment every job in `jobs`, at most `n_workers` at a time.
    pub async fn run_augmentations<A: Augmenter>(
        &self,
        augmenter: &A,
        jobs: Vec<AugmentJob>,
        n_workers: usize,
    ) -> BatchSummary {
        let n_workers = n_workers.max(1);
        tracing::info!(images = jobs.len(), n_workers, "Augmentation batch started");

        let outcomes: Vec<JobOutcome<()>> = stream::iter(jobs)
            .map(move |job| self.augment_one(augmenter, job))
            .buffer_unordered(n_workers)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for outcome in &outcomes {
            summary.record(outcome);
        }
        tracing::info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "Augmentation batch finished",
        );
        summary
    }

    async fn augment_one<A: Augmenter>(&self, augmenter: &A, job: AugmentJob) -> JobOutcome<()> {
        if self.cancel.is_cancelled() {
            return JobOutcome::Skipped;
        }
        match augmenter.augment(&job).await {
            Ok(()) => JobOutcome::Succeeded(()),
            Err(e) => {
                tracing::error!(
                    index = job.index,
                    path = %job.image_path.display(),
                    error = %e,
                    "Augmentation job failed",
                );
                JobOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

async fn render_with_retry<R: Renderer>(
    renderer: &R,
    request: &RenderRequest,
    max_attempts: u32,
) -> Result<RenderOutput, RenderError> {
    let mut attempt = 1;
    loop {
        match renderer.render(request).await {
            Ok(output) => return Ok(output),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    job_index = request.job_index,
                    attempt,
                    error = %e,
                    "Render attempt failed; retrying",
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
