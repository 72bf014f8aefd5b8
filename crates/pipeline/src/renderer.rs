//! The renderer seam.
//!
//! A [`Renderer`] turns a sampled scene into an image file plus the
//! geometry needed to annotate it. [`ProcessRenderer`] drives an external
//! program: the request goes in as JSON on stdin, and the program prints a
//! JSON reply on stdout.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use synthblend_core::geometry::{Camera, CameraIntrinsics};
use synthblend_core::process::executor::{CommandRunner, ProcessError, ProcessInput};
use synthblend_core::projection::GeometrySample;
use synthblend_core::sampler::SceneParameters;
use synthblend_core::types::{job_id, JobIndex};

/// Errors from a single render attempt.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Renderer process failed: {0}")]
    Script(#[from] ProcessError),

    #[error("Renderer produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("Rendered image is unreadable: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to record annotation: {0}")]
    Dataset(#[from] synthblend_dataset::DatasetError),
}

impl RenderError {
    /// Errors that will recur for every job, so the batch should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Script(e) if e.is_fatal())
    }

    /// Errors worth another render attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Script(e) => !e.is_fatal(),
            Self::InvalidOutput(_) | Self::Image(_) => true,
            Self::Dataset(_) => false,
        }
    }
}

/// Everything the renderer needs for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub job_index: JobIndex,
    pub scene: SceneParameters,
    pub img_size: u32,
    pub output_path: PathBuf,
}

/// What a successful render produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutput {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub geometry: GeometrySample,
}

/// Produces one image per request.
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        request: &RenderRequest,
    ) -> impl Future<Output = Result<RenderOutput, RenderError>> + Send;
}

// ---------------------------------------------------------------------------
// Process-backed renderer
// ---------------------------------------------------------------------------

/// Lens overrides the renderer may report.
#[derive(Debug, Clone, Default, Deserialize)]
struct ReplyCamera {
    focal_length_mm: Option<f64>,
    sensor_width_mm: Option<f64>,
}

/// JSON printed by the renderer on stdout.
#[derive(Debug, Clone, Deserialize)]
struct RendererReply {
    image: PathBuf,
    vertices: Vec<[f64; 3]>,
    #[serde(default)]
    camera: Option<ReplyCamera>,
}

/// Runs an external renderer program once per job.
#[derive(Debug, Clone)]
pub struct ProcessRenderer {
    runner: CommandRunner,
    timeout: Duration,
    working_directory: Option<PathBuf>,
}

impl ProcessRenderer {
    pub fn new(runner: CommandRunner, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            working_directory: None,
        }
    }

    /// Run the renderer from `dir` (so relative script paths resolve there).
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    fn input(&self, request: &RenderRequest) -> Result<ProcessInput, RenderError> {
        let data = serde_json::to_value(request)
            .map_err(|e| RenderError::InvalidOutput(format!("Unserializable request: {e}")))?;
        Ok(ProcessInput {
            data,
            env_vars: vec![
                ("SYNTHBLEND_JOB_ID".to_string(), job_id(request.job_index)),
                (
                    "SYNTHBLEND_OUTPUT".to_string(),
                    request.output_path.display().to_string(),
                ),
            ],
            working_directory: self.working_directory.clone(),
            timeout: self.timeout,
        })
    }
}

impl Renderer for ProcessRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        let output = self.runner.run(&[], self.input(request)?).await?;
        tracing::debug!(
            job_index = request.job_index,
            duration_ms = output.duration_ms,
            "Renderer process finished",
        );

        let parsed = output.parsed_output.ok_or_else(|| {
            RenderError::InvalidOutput("stdout did not contain a JSON reply".to_string())
        })?;
        let reply: RendererReply = serde_json::from_value(parsed)
            .map_err(|e| RenderError::InvalidOutput(format!("Malformed reply: {e}")))?;

        let base = request.output_path.parent().unwrap_or(Path::new(""));
        interpret_reply(request, reply, base)
    }
}

/// Check the reply against the request and assemble the geometry sample.
fn interpret_reply(
    request: &RenderRequest,
    reply: RendererReply,
    base: &Path,
) -> Result<RenderOutput, RenderError> {
    if reply.vertices.is_empty() {
        return Err(RenderError::InvalidOutput(
            "reply has no object vertices".to_string(),
        ));
    }
    let image_path = if reply.image.is_absolute() {
        reply.image
    } else {
        base.join(reply.image)
    };
    if !image_path.is_file() {
        return Err(RenderError::InvalidOutput(format!(
            "image {} was not written",
            image_path.display()
        )));
    }

    let (width, height) = image::image_dimensions(&image_path)?;
    if (width, height) != (request.img_size, request.img_size) {
        tracing::warn!(
            job_index = request.job_index,
            width,
            height,
            img_size = request.img_size,
            "Rendered image size differs from the requested size",
        );
    }

    let mut intrinsics = CameraIntrinsics::square(request.img_size);
    intrinsics.resolution_x = width;
    intrinsics.resolution_y = height;
    if let Some(camera) = reply.camera {
        if let Some(f) = camera.focal_length_mm {
            intrinsics.focal_length_mm = f;
        }
        if let Some(s) = camera.sensor_width_mm {
            intrinsics.sensor_width_mm = s;
        }
    }

    Ok(RenderOutput {
        image_path,
        width,
        height,
        geometry: GeometrySample {
            vertices: reply.vertices.into_iter().map(DVec3::from_array).collect(),
            camera: Camera {
                position: request.scene.camera_position,
                rotation: request.scene.camera_rotation,
                intrinsics,
            },
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use synthblend_core::geometry::fixed_orientation;

    use super::*;

    fn request(dir: &Path) -> RenderRequest {
        RenderRequest {
            job_index: 7,
            scene: SceneParameters {
                job_index: 7,
                model_id: "crate".into(),
                model_path: PathBuf::from("models/crate/model.dae"),
                category_index: 0,
                texture: None,
                background: None,
                phi: 0.5,
                theta: 1.0,
                radius: 4.0,
                camera_position: DVec3::new(0.0, 0.0, 4.0),
                camera_rotation: fixed_orientation(0.0, -std::f64::consts::FRAC_PI_2),
                light_position: DVec3::new(0.0, 0.0, 8.0),
                scale: 1.0,
                shadow_enabled: true,
            },
            img_size: 16,
            output_path: dir.join("render_00007.png"),
        }
    }

    fn write_png(path: &Path, size: u32) {
        image::RgbaImage::new(size, size).save(path).expect("save png");
    }

    #[test]
    fn fatal_and_retryable_classification() {
        let missing = RenderError::Script(ProcessError::NotFound("blender".into()));
        assert!(missing.is_fatal());
        assert!(!missing.is_retryable());

        let timeout = RenderError::Script(ProcessError::Timeout { elapsed_ms: 10 });
        assert!(!timeout.is_fatal());
        assert!(timeout.is_retryable());

        assert!(RenderError::InvalidOutput("x".into()).is_retryable());
    }

    #[test]
    fn reply_with_relative_image_resolves_against_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(&dir.path().join("render_00007.png"), 16);
        let reply = RendererReply {
            image: PathBuf::from("render_00007.png"),
            vertices: vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.0]],
            camera: Some(ReplyCamera {
                focal_length_mm: Some(35.0),
                sensor_width_mm: None,
            }),
        };

        let req = request(dir.path());
        let output = interpret_reply(&req, reply, dir.path()).expect("valid reply");
        assert_eq!(output.image_path, dir.path().join("render_00007.png"));
        assert_eq!((output.width, output.height), (16, 16));
        assert_eq!(output.geometry.vertices.len(), 2);
        assert_eq!(output.geometry.camera.intrinsics.focal_length_mm, 35.0);
        assert_eq!(output.geometry.camera.position, req.scene.camera_position);
    }

    #[test]
    fn reply_without_vertices_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_png(&dir.path().join("render_00007.png"), 16);
        let reply = RendererReply {
            image: PathBuf::from("render_00007.png"),
            vertices: vec![],
            camera: None,
        };
        assert_matches!(
            interpret_reply(&request(dir.path()), reply, dir.path()),
            Err(RenderError::InvalidOutput(_))
        );
    }

    #[test]
    fn reply_naming_missing_image_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reply = RendererReply {
            image: PathBuf::from("render_00007.png"),
            vertices: vec![[0.0, 0.0, 0.0]],
            camera: None,
        };
        assert_matches!(
            interpret_reply(&request(dir.path()), reply, dir.path()),
            Err(RenderError::InvalidOutput(msg)) if msg.contains("was not written")
        );
    }

    #[test]
    fn request_serializes_scene_for_the_renderer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let value = serde_json::to_value(request(dir.path())).expect("serialize");
        assert_eq!(value["job_index"], 7);
        assert_eq!(value["img_size"], 16);
        assert_eq!(value["scene"]["model_id"], "crate");
        assert!(value["scene"]["camera_position"].is_array());
    }
}
