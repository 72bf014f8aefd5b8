//! Scene parameter sampling.
//!
//! [`SceneSampler::sample`] turns a job index into a reproducible,
//! bounded-random scene: asset choice, camera pose, light, and scale.
//! Each job draws from its own rng seeded from `(seed, job_index)`, so
//! results do not depend on scheduling order.

use std::path::PathBuf;

use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::catalog::AssetCatalog;
use crate::config::{
    AngleRange, Config, LightPlacement, OrientationMode, RadiusSpec, ScaleJitterMode,
    SelectionPolicy,
};
use crate::geometry::{fixed_orientation, look_at, spherical_to_cartesian, Camera, CameraIntrinsics};
use crate::types::JobIndex;

/// Uniform scale applied to the background plane.
pub const BACKGROUND_PLANE_SCALE: f64 = 4.0;

/// Odd constant used to spread consecutive job indices across seeds.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Rng for job `job_index` within a batch seeded with `seed`.
///
/// `stream` separates independent consumers (sampling, augmentation) so
/// they never share a sequence.
pub fn job_rng(seed: u64, job_index: JobIndex, stream: u64) -> StdRng {
    let mixed = seed
        ^ job_index.wrapping_add(1).wrapping_mul(SEED_STRIDE)
        ^ stream.rotate_left(32);
    StdRng::seed_from_u64(mixed)
}

/// Stream id for scene sampling draws.
pub const SAMPLE_STREAM: u64 = 0;

/// Stream id for augmentation draws.
pub const AUGMENT_STREAM: u64 = 1;

/// Image plane placed behind the subject, facing the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundPlane {
    pub image: PathBuf,
    pub position: DVec3,
    pub rotation: DVec3,
    pub scale: f64,
}

/// Complete description of one scene. Created once per job and immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneParameters {
    pub job_index: JobIndex,
    pub model_id: String,
    pub model_path: PathBuf,
    pub category_index: usize,
    /// `None` renders the model untextured.
    pub texture: Option<PathBuf>,
    pub background: Option<BackgroundPlane>,
    pub phi: f64,
    pub theta: f64,
    pub radius: f64,
    pub camera_position: DVec3,
    /// XYZ Euler rotation in radians.
    pub camera_rotation: DVec3,
    pub light_position: DVec3,
    /// Uniform scale factor applied to the model on all axes.
    pub scale: f64,
    pub shadow_enabled: bool,
}

impl SceneParameters {
    /// The camera these parameters describe, for a square image.
    pub fn camera(&self, img_size: u32) -> Camera {
        Camera {
            position: self.camera_position,
            rotation: self.camera_rotation,
            intrinsics: CameraIntrinsics::square(img_size),
        }
    }
}

/// Sampling options extracted from [`Config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub radius: RadiusSpec,
    pub phi_range: AngleRange,
    pub theta_range: AngleRange,
    pub scale_jitter: f64,
    pub scale_jitter_mode: ScaleJitterMode,
    pub orientation: OrientationMode,
    pub light: LightPlacement,
    pub selection: SelectionPolicy,
    pub shadow_enabled: bool,
    pub img_size: u32,
}

impl From<&Config> for SamplerConfig {
    fn from(config: &Config) -> Self {
        Self {
            radius: config.radius,
            phi_range: config.phi_range,
            theta_range: config.theta_range,
            scale_jitter: config.scale_jitter,
            scale_jitter_mode: config.scale_jitter_mode,
            orientation: config.orientation,
            light: config.light,
            selection: config.selection,
            shadow_enabled: config.shadow_enabled,
            img_size: config.img_size,
        }
    }
}

/// Pure, renderer-independent scene sampler.
#[derive(Debug, Clone)]
pub struct SceneSampler {
    config: SamplerConfig,
    seed: u64,
}

impl SceneSampler {
    pub fn new(config: SamplerConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Which scale jitter policy is active.
    pub fn scale_jitter_mode(&self) -> ScaleJitterMode {
        self.config.scale_jitter_mode
    }

    /// Sample the scene for `job_index`. Same inputs, same output.
    pub fn sample(&self, job_index: JobIndex, catalog: &AssetCatalog) -> SceneParameters {
        let mut rng = job_rng(self.seed, job_index, SAMPLE_STREAM);
        let c = &self.config;

        let asset = catalog.select_model(c.selection, job_index, &mut rng);
        let texture = catalog
            .select_texture(asset, c.selection, job_index, &mut rng)
            .map(PathBuf::from);
        let background_image = catalog.select_background(&mut rng).map(PathBuf::from);

        let phi = c.phi_range.lerp(rng.random::<f64>());
        let theta = c.theta_range.lerp(rng.random::<f64>());
        let radius = match c.radius {
            RadiusSpec::Fixed(r) => r,
            RadiusSpec::Range { min, max } => min + (max - min) * rng.random::<f64>(),
        };
        let scale = self.scale_factor(&mut rng);

        let (target, offset) = match c.orientation {
            OrientationMode::Fixed => (DVec3::ZERO, spherical_to_cartesian(phi, theta, radius)),
            OrientationMode::LookAt { target } => {
                (target, spherical_to_cartesian(phi, theta, radius))
            }
        };
        let camera_position = target + offset;
        let camera_rotation = match c.orientation {
            OrientationMode::Fixed => fixed_orientation(phi, theta),
            OrientationMode::LookAt { target } => {
                look_at(camera_position, target).unwrap_or_else(|| fixed_orientation(phi, theta))
            }
        };

        let light_position = match c.light {
            LightPlacement::Colocated => camera_position,
            LightPlacement::Above => camera_position + DVec3::Z * radius,
            LightPlacement::Offset(delta) => camera_position + delta,
        };

        let background = background_image.map(|image| BackgroundPlane {
            image,
            position: target - offset,
            rotation: camera_rotation,
            scale: BACKGROUND_PLANE_SCALE,
        });

        SceneParameters {
            job_index,
            model_id: asset.id.clone(),
            model_path: asset.model_path.clone(),
            category_index: asset.category_index,
            texture,
            background,
            phi,
            theta,
            radius,
            camera_position,
            camera_rotation,
            light_position,
            scale,
            shadow_enabled: c.shadow_enabled,
        }
    }

    fn scale_factor<R: Rng>(&self, rng: &mut R) -> f64 {
        let jitter = self.config.scale_jitter;
        match self.config.scale_jitter_mode {
            ScaleJitterMode::Fixed => 1.0 + jitter,
            ScaleJitterMode::Signed => 1.0 + jitter * (2.0 * rng.random::<f64>() - 1.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
