//! One render job: sample the scene, describe it to the renderer, then
//! annotate the result and hand the annotation to its sink.

use std::collections::HashSet;
use std::path::PathBuf;

use synthblend_core::annotation::{Annotation, CocoEncoding};
use synthblend_core::catalog::AssetCatalog;
use synthblend_core::config::{CocoBboxConvention, ImageFormat};
use synthblend_core::projection::{annotate, ObjectAnnotation};
use synthblend_core::sampler::{SceneParameters, SceneSampler};
use synthblend_core::types::{job_id, render_stem, JobIndex};
use synthblend_dataset::shards::ShardLog;
use synthblend_dataset::sidecar::{sidecar_path, write_yolo};
use synthblend_dataset::{AccumulatorHandle, DatasetEntry, ImageRecord};

use crate::renderer::{RenderError, RenderOutput, RenderRequest};

/// Where annotations go.
#[derive(Debug, Clone)]
pub enum AnnotationSink {
    /// Images only.
    None,
    /// `render_<id>.txt` next to each image.
    Yolo,
    /// Shared COCO manifest. Each entry is first logged as a shard, then
    /// submitted to the accumulator; the shard is removed once persisted.
    Coco {
        accumulator: AccumulatorHandle,
        shards: ShardLog,
        convention: CocoBboxConvention,
        /// Image ids already in the manifest when the batch started. Their
        /// jobs are not rendered again, since the manifest would keep
        /// describing the old image.
        recorded: HashSet<String>,
    },
}

/// Result of a completed render job.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub job_index: JobIndex,
    pub image_path: PathBuf,
    pub annotation: Option<Annotation>,
    /// The object is entirely outside the frame or behind the camera.
    pub degenerate: bool,
}

/// Shared, read-only state for every render job of a batch.
#[derive(Debug)]
pub struct RenderContext {
    pub sampler: SceneSampler,
    pub catalog: AssetCatalog,
    pub renders_dir: PathBuf,
    pub image_format: ImageFormat,
    pub sink: AnnotationSink,
}

impl RenderContext {
    /// `renders/render_<id>.<ext>`.
    pub fn output_path(&self, job_index: JobIndex) -> PathBuf {
        self.renders_dir.join(format!(
            "{}.{}",
            render_stem(job_index),
            self.image_format.extension()
        ))
    }

    /// Whether the sink already holds an annotation for `job_index`.
    pub fn is_recorded(&self, job_index: JobIndex) -> bool {
        match &self.sink {
            AnnotationSink::Coco { recorded, .. } => recorded.contains(&job_id(job_index)),
            AnnotationSink::None | AnnotationSink::Yolo => false,
        }
    }

    /// Sample the scene for `job_index` and build the renderer request.
    pub fn request(&self, job_index: JobIndex) -> RenderRequest {
        let scene = self.sampler.sample(job_index, &self.catalog);
        tracing::debug!(
            job_index,
            model_id = %scene.model_id,
            textured = scene.texture.is_some(),
            phi = scene.phi,
            theta = scene.theta,
            radius = scene.radius,
            "Sampled scene",
        );
        RenderRequest {
            job_index,
            img_size: self.sampler.config().img_size,
            output_path: self.output_path(job_index),
            scene,
        }
    }

    /// Annotate a finished render and deliver the annotation to the sink.
    pub async fn export(
        &self,
        request: &RenderRequest,
        output: RenderOutput,
    ) -> Result<RenderedImage, RenderError> {
        let object = annotate(&output.geometry);
        if object.degenerate {
            tracing::warn!(
                job_index = request.job_index,
                model_id = %request.scene.model_id,
                "Object is off-frame; recording a zero-area annotation",
            );
        }
        if object.truncated {
            tracing::warn!(
                job_index = request.job_index,
                model_id = %request.scene.model_id,
                "Object crosses the camera plane; its box covers only the visible vertices",
            );
        }

        let annotation = match &self.sink {
            AnnotationSink::None => None,
            AnnotationSink::Yolo => {
                let label = object.yolo(request.scene.category_index);
                write_yolo(&sidecar_path(&output.image_path), &[label]).await?;
                Some(Annotation::Yolo(label))
            }
            AnnotationSink::Coco {
                accumulator,
                shards,
                convention,
                ..
            } => {
                let entry = coco_entry(&request.scene, &object, &output, *convention);
                let annotation = entry.annotation.clone();
                shards.write(&entry).await?;
                accumulator.submit(entry).await?;
                shards.remove(&annotation.image_id).await?;
                Some(Annotation::Coco(annotation))
            }
        };

        Ok(RenderedImage {
            job_index: request.job_index,
            image_path: output.image_path,
            annotation,
            degenerate: object.degenerate,
        })
    }
}

/// Image record plus annotation for one render. The zero-padded job index
/// is both the image id and the annotation id.
fn coco_entry(
    scene: &SceneParameters,
    object: &ObjectAnnotation,
    output: &RenderOutput,
    convention: CocoBboxConvention,
) -> DatasetEntry {
    let id = job_id(scene.job_index);
    let file_name = output
        .image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut image = ImageRecord::new(id.clone(), file_name, output.width);
    image.height = output.height;

    let encoding = CocoEncoding {
        width: output.width,
        height: output.height,
        convention,
    };
    DatasetEntry {
        image,
        annotation: object.coco(&id, scene.category_index, &id, &encoding),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;
    use glam::DVec3;
    use synthblend_core::catalog::{Asset, AssetKind};
    use synthblend_core::config::{Config, SelectionPolicy};
    use synthblend_core::projection::GeometrySample;
    use synthblend_core::sampler::SamplerConfig;
    use synthblend_dataset::manifest::load_or_create;
    use synthblend_dataset::sidecar::read_yolo;
    use synthblend_dataset::Accumulator;

    use super::*;

    fn context(dir: &Path, sink: AnnotationSink) -> RenderContext {
        let mut config = Config::with_defaults(dir);
        config.img_size = 64;
        config.selection = SelectionPolicy::Index;
        let models = (0..3)
            .map(|i| Asset {
                id: format!("model_{i}"),
                model_path: dir.join(format!("models/model_{i}/model.dae")),
                kind: AssetKind::Untextured,
                category_index: i,
            })
            .collect();
        RenderContext {
            sampler: SceneSampler::new(SamplerConfig::from(&config), 42),
            catalog: AssetCatalog::from_parts(models, vec![]).expect("catalog"),
            renders_dir: dir.join("renders"),
            image_format: ImageFormat::Png,
            sink,
        }
    }

    /// Output whose geometry is a small square straight in front of the camera.
    fn centered_output(request: &RenderRequest) -> RenderOutput {
        let camera = request.scene.camera(request.img_size);
        let forward = (DVec3::ZERO - camera.position).normalize();
        let right = forward.any_orthonormal_vector();
        let up = forward.cross(right);
        let vertices = [right + up, right - up, -right - up, -right + up]
            .iter()
            .map(|d| *d * 0.1)
            .collect();
        RenderOutput {
            image_path: request.output_path.clone(),
            width: request.img_size,
            height: request.img_size,
            geometry: GeometrySample { vertices, camera },
        }
    }

    #[test]
    fn output_path_uses_zero_padded_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), AnnotationSink::None);
        assert_eq!(
            ctx.output_path(3),
            dir.path().join("renders/render_00003.png")
        );
    }

    #[test]
    fn request_selects_model_by_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), AnnotationSink::None);
        let request = ctx.request(4);
        assert_eq!(request.scene.model_id, "model_1");
        assert_eq!(request.img_size, 64);
    }

    #[tokio::test]
    async fn yolo_sink_writes_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), AnnotationSink::Yolo);
        let request = ctx.request(2);
        let output = centered_output(&request);

        let rendered = ctx.export(&request, output).await.expect("export");
        assert!(!rendered.degenerate);
        let labels = read_yolo(&dir.path().join("renders/render_00002.txt"))
            .await
            .expect("sidecar");
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].class_id, 2);
        assert!((labels[0].center_x - 0.5).abs() < 1e-6);
        assert!((labels[0].center_y - 0.5).abs() < 1e-6);
        assert_matches!(rendered.annotation, Some(Annotation::Yolo(_)));
    }

    #[tokio::test]
    async fn coco_sink_persists_and_clears_shard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = dir.path().join("renders/coco.json");
        let (accumulator, task) = Accumulator::spawn(&manifest, vec![], 4)
            .await
            .expect("spawn");
        let shards = ShardLog::open(dir.path().join("renders/shards"))
            .await
            .expect("shards");
        let ctx = context(
            dir.path(),
            AnnotationSink::Coco {
                accumulator,
                shards: shards.clone(),
                convention: CocoBboxConvention::Standard,
                recorded: HashSet::from(["00004".to_string()]),
            },
        );
        assert!(ctx.is_recorded(4));
        assert!(!ctx.is_recorded(1));

        let request = ctx.request(1);
        let output = centered_output(&request);
        let rendered = ctx.export(&request, output).await.expect("export");
        let Some(Annotation::Coco(annotation)) = rendered.annotation else {
            panic!("expected a COCO annotation");
        };
        assert_eq!(annotation.image_id, "00001");
        assert_eq!(annotation.category_id, 1);
        assert!(annotation.area > 0.0);
        assert!(shards.pending().await.expect("pending").is_empty());

        drop(ctx);
        task.await.expect("accumulator");
        let dataset = load_or_create(&manifest, vec![]).await.expect("load");
        assert_eq!(dataset.images.len(), 1);
        assert_eq!(dataset.images[0].file_name, "render_00001.png");
    }

    #[tokio::test]
    async fn off_frame_object_is_flagged_degenerate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), AnnotationSink::None);
        let request = ctx.request(0);
        let mut output = centered_output(&request);
        // Behind the camera: nothing projects.
        let behind = request.scene.camera_position * 2.0;
        output.geometry.vertices = vec![behind];

        let rendered = ctx.export(&request, output).await.expect("export");
        assert!(rendered.degenerate);
        assert!(rendered.annotation.is_none());
    }
}
