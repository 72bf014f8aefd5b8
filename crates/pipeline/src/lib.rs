//! Render and augmentation pipeline.
//!
//! - [`renderer`]: the seam to the external renderer and its process-backed
//!   implementation.
//! - [`render`]: one render job, from sampled scene to exported annotation.
//! - [`augment`]: background compositing and pixel transforms.
//! - [`orchestrator`]: bounded fan-out of render and augmentation jobs.

pub mod augment;
pub mod orchestrator;
pub mod render;
pub mod renderer;

pub use augment::{AugmentError, AugmentJob, Augmenter, PipelineAugmenter};
pub use orchestrator::{BatchSummary, JobOutcome, Orchestrator, RenderBatch};
pub use render::{AnnotationSink, RenderContext, RenderedImage};
pub use renderer::{ProcessRenderer, RenderError, RenderOutput, RenderRequest, Renderer};
