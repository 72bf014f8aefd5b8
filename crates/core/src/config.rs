//! Batch configuration.
//!
//! A single immutable [`Config`] value is built once (by the CLI) and
//! threaded explicitly into the catalog, sampler, and orchestrator.

use std::f64::consts::{FRAC_PI_2, PI, TAU};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::JobIndex;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_IMG_SIZE: u32 = 1024;
pub const DEFAULT_RADIUS: f64 = 4.0;
pub const DEFAULT_RENDER_COUNT: u64 = 1000;
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(300);

/// One initial attempt plus one retry.
pub const DEFAULT_MAX_RENDER_ATTEMPTS: u32 = 2;

pub const DEFAULT_MODELS_DIR: &str = "models";
pub const DEFAULT_BACKGROUNDS_DIR: &str = "backgrounds";
pub const DEFAULT_RENDERS_DIR: &str = "renders";
pub const DEFAULT_MANIFEST_FILE: &str = "coco.json";

// ---------------------------------------------------------------------------
// Option types
// ---------------------------------------------------------------------------

/// Inclusive `[min, max]` range of angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleRange {
    pub min: f64,
    pub max: f64,
}

impl AngleRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Map `u ∈ [0, 1)` linearly onto the range.
    pub fn lerp(&self, u: f64) -> f64 {
        self.min + (self.max - self.min) * u
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Camera distance from the subject: a fixed value or a uniform range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadiusSpec {
    Fixed(f64),
    Range { min: f64, max: f64 },
}

impl FromStr for RadiusSpec {
    type Err = CoreError;

    /// Parses `"4"` or `"3.5..6"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim().parse::<f64>().map_err(|_| {
                CoreError::Validation(format!("Invalid radius '{s}': expected a number or 'min..max'"))
            })
        };
        match s.split_once("..") {
            Some((min, max)) => Ok(Self::Range {
                min: parse(min)?,
                max: parse(max)?,
            }),
            None => Ok(Self::Fixed(parse(s)?)),
        }
    }
}

/// How the configured `scale_jitter` turns into a per-job scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleJitterMode {
    /// Factor is always `1 + scale_jitter`.
    Fixed,
    /// Factor is `1 + scale_jitter · (2u − 1)`, `u` uniform in `[0, 1)`.
    Signed,
}

/// How the camera rotation is derived from its position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationMode {
    /// `(phi, 0, theta + π/2)`; only valid when the subject sits at the origin.
    Fixed,
    /// Explicit look-at towards `target`.
    LookAt { target: DVec3 },
}

/// Where the light goes relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightPlacement {
    Colocated,
    /// `(0, 0, r)` above the camera, `r` being the job's sampled radius.
    Above,
    Offset(DVec3),
}

/// Output annotation format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BboxFormat {
    Yolo,
    Coco,
    None,
}

impl FromStr for BboxFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yolo" => Ok(Self::Yolo),
            "coco" => Ok(Self::Coco),
            "none" => Ok(Self::None),
            _ => Err(CoreError::Validation(format!(
                "Invalid bounding box format '{s}'. Must be one of: YOLO, COCO, none"
            ))),
        }
    }
}

/// Layout of the COCO `bbox` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CocoBboxConvention {
    /// `[min_x, min_y, width, height]`, the standard COCO layout.
    Standard,
    /// `[max_x, max_y, width, height]`, as written by older exports.
    Legacy,
}

/// Asset selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// `models[job_index mod len]`, reproducible across runs.
    Index,
    /// Uniform choice from the job's seeded rng.
    Random,
}

/// Encoding of rendered images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Png,
    Jpg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpg),
            _ => Err(CoreError::Validation(format!(
                "Invalid image format '{s}'. Must be one of: png, jpg"
            ))),
        }
    }
}

/// External renderer invocation: program plus fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendererCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// One step of the augmentation pipeline. Each step draws its own
/// parameters from the job's rng within the given limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AugmentStep {
    GaussianBlur { sigma_max: f32 },
    GaussNoise { var_min: f32, var_max: f32 },
    HueSaturationValue { hue_shift: i32, sat_shift: i32, val_shift: i32 },
    BrightnessContrast { brightness_limit: f32, contrast_limit: f32 },
    Rotate { limit_degrees: f32 },
    HorizontalFlip { p: f64 },
}

impl AugmentStep {
    /// Whether the step moves pixels, which would invalidate the labels
    /// written at render time.
    pub fn is_geometric(&self) -> bool {
        matches!(self, Self::Rotate { .. } | Self::HorizontalFlip { .. })
    }
}

/// Noise, colour jitter, then brightness/contrast.
pub fn default_augment_steps() -> Vec<AugmentStep> {
    vec![
        AugmentStep::GaussNoise {
            var_min: 10.0,
            var_max: 50.0,
        },
        AugmentStep::HueSaturationValue {
            hue_shift: 5,
            sat_shift: 10,
            val_shift: 50,
        },
        AugmentStep::BrightnessContrast {
            brightness_limit: 0.2,
            contrast_limit: 0.2,
        },
    ]
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Complete, immutable configuration for one generation batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root against which relative directories resolve.
    pub work_dir: PathBuf,
    pub models_dir: PathBuf,
    pub backgrounds_dir: PathBuf,
    pub renders_dir: PathBuf,
    /// COCO manifest; relative paths resolve against `renders_dir`.
    pub manifest_path: PathBuf,

    pub img_size: u32,
    pub radius: RadiusSpec,
    pub phi_range: AngleRange,
    pub theta_range: AngleRange,
    pub scale_jitter: f64,
    pub scale_jitter_mode: ScaleJitterMode,
    pub orientation: OrientationMode,
    pub light: LightPlacement,
    pub shadow_enabled: bool,

    pub bbox_format: BboxFormat,
    pub coco_bbox: CocoBboxConvention,
    pub selection: SelectionPolicy,
    /// Base seed for per-job rngs. `None` means "draw one at start-up".
    pub seed: Option<u64>,

    /// Index of the first job; lets a later batch extend an existing dataset.
    pub start_index: u64,
    pub render_count: u64,
    pub render_workers: usize,
    pub augment_workers: usize,
    pub render_timeout: Duration,
    pub max_render_attempts: u32,
    pub image_format: ImageFormat,
    pub renderer: RendererCommand,
    pub augment: Vec<AugmentStep>,
}

impl Config {
    /// Configuration with every option at its default, rooted at `work_dir`.
    pub fn with_defaults(work_dir: impl Into<PathBuf>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            work_dir: work_dir.into(),
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            backgrounds_dir: PathBuf::from(DEFAULT_BACKGROUNDS_DIR),
            renders_dir: PathBuf::from(DEFAULT_RENDERS_DIR),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST_FILE),
            img_size: DEFAULT_IMG_SIZE,
            radius: RadiusSpec::Fixed(DEFAULT_RADIUS),
            phi_range: AngleRange::new(0.0, FRAC_PI_2),
            theta_range: AngleRange::new(0.0, TAU),
            scale_jitter: 0.0,
            scale_jitter_mode: ScaleJitterMode::Fixed,
            orientation: OrientationMode::Fixed,
            light: LightPlacement::Above,
            shadow_enabled: true,
            bbox_format: BboxFormat::Coco,
            coco_bbox: CocoBboxConvention::Standard,
            selection: SelectionPolicy::Random,
            seed: None,
            start_index: 0,
            render_count: DEFAULT_RENDER_COUNT,
            render_workers: workers,
            augment_workers: workers,
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            max_render_attempts: DEFAULT_MAX_RENDER_ATTEMPTS,
            image_format: ImageFormat::Png,
            renderer: RendererCommand {
                program: "blender".to_string(),
                args: vec!["-b".to_string(), "--python".to_string(), "render.py".to_string(), "--".to_string()],
            },
            augment: default_augment_steps(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    pub fn models_path(&self) -> PathBuf {
        self.resolve(&self.models_dir)
    }

    pub fn backgrounds_path(&self) -> PathBuf {
        self.resolve(&self.backgrounds_dir)
    }

    pub fn renders_path(&self) -> PathBuf {
        self.resolve(&self.renders_dir)
    }

    pub fn manifest_file(&self) -> PathBuf {
        if self.manifest_path.is_absolute() {
            self.manifest_path.clone()
        } else {
            self.renders_path().join(&self.manifest_path)
        }
    }

    /// Job indices of this batch.
    pub fn job_indices(&self) -> std::ops::Range<JobIndex> {
        self.start_index..self.start_index.saturating_add(self.render_count)
    }

    /// Directory holding per-job annotation shards awaiting compaction.
    pub fn shards_path(&self) -> PathBuf {
        self.renders_path().join("shards")
    }

    /// Check every invariant the sampler and orchestrator rely on.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.work_dir.is_dir() {
            return Err(CoreError::Configuration(format!(
                "Working directory {} does not exist",
                self.work_dir.display()
            )));
        }
        if self.img_size == 0 {
            return Err(CoreError::Configuration("img_size must be positive".to_string()));
        }
        validate_radius(&self.radius)?;
        validate_range("phi", &self.phi_range)?;
        validate_range("theta", &self.theta_range)?;
        if self.phi_range.min < 0.0 || self.phi_range.max > PI {
            return Err(CoreError::Configuration(format!(
                "phi range [{}, {}] must lie within [0, π]",
                self.phi_range.min, self.phi_range.max
            )));
        }
        if !(0.0..1.0).contains(&self.scale_jitter) {
            return Err(CoreError::Configuration(format!(
                "scale_jitter must be in [0, 1), got {}",
                self.scale_jitter
            )));
        }
        if self.render_workers == 0 || self.augment_workers == 0 {
            return Err(CoreError::Configuration(
                "Worker counts must be at least 1".to_string(),
            ));
        }
        if self.max_render_attempts == 0 {
            return Err(CoreError::Configuration(
                "max_render_attempts must be at least 1".to_string(),
            ));
        }
        if self.render_timeout.is_zero() {
            return Err(CoreError::Configuration(
                "render_timeout must be positive".to_string(),
            ));
        }
        if self.renderer.program.trim().is_empty() {
            return Err(CoreError::Configuration(
                "Renderer program must not be empty".to_string(),
            ));
        }
        if self.bbox_format != BboxFormat::None {
            if let Some(step) = self.augment.iter().find(|s| s.is_geometric()) {
                return Err(CoreError::Configuration(format!(
                    "Augmentation step {step:?} moves the object and would invalidate \
                     {:?} labels; use it only with bbox format none",
                    self.bbox_format
                )));
            }
        }
        Ok(())
    }
}

fn validate_range(name: &str, range: &AngleRange) -> Result<(), CoreError> {
    if !range.min.is_finite() || !range.max.is_finite() {
        return Err(CoreError::Configuration(format!("{name} range must be finite")));
    }
    if range.min > range.max {
        return Err(CoreError::Configuration(format!(
            "{name} range is inverted: min {} > max {}",
            range.min, range.max
        )));
    }
    Ok(())
}

fn validate_radius(radius: &RadiusSpec) -> Result<(), CoreError> {
    let (min, max) = match *radius {
        RadiusSpec::Fixed(r) => (r, r),
        RadiusSpec::Range { min, max } => (min, max),
    };
    if !(min.is_finite() && max.is_finite()) || min <= 0.0 {
        return Err(CoreError::Configuration(format!(
            "Radius must be positive and finite, got {min}..{max}"
        )));
    }
    if min > max {
        return Err(CoreError::Configuration(format!(
            "Radius range is inverted: {min} > {max}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
