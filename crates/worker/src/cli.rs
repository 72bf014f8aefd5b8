//! Command-line flags and their mapping onto [`Config`].
//!
//! Every flag can also be set through a `SYNTHBLEND_*` environment variable
//! (a `.env` file is loaded first by the binary).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use glam::DVec3;
use synthblend_core::config::{
    AngleRange, AugmentStep, BboxFormat, CocoBboxConvention, Config, ImageFormat,
    LightPlacement, OrientationMode, RadiusSpec, ScaleJitterMode, SelectionPolicy,
};
use synthblend_core::error::CoreError;

/// Which parts of the pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    /// Render, then augment this batch's renders.
    All,
    Render,
    /// Augment every render already in the renders directory.
    Augment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Selection {
    Index,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CocoBbox {
    /// `[min_x, min_y, w, h]`
    Standard,
    /// `[max_x, max_y, w, h]`
    Legacy,
}

/// Generate a labelled synthetic object-detection dataset.
#[derive(Debug, Clone, Parser)]
#[command(name = "synthblend-worker", version, about)]
pub struct Cli {
    /// Root directory; relative paths below resolve against it.
    #[arg(long, env = "SYNTHBLEND_WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    #[arg(long, env = "SYNTHBLEND_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    #[arg(long, env = "SYNTHBLEND_BACKGROUNDS_DIR")]
    pub backgrounds_dir: Option<PathBuf>,

    #[arg(long, env = "SYNTHBLEND_RENDERS_DIR")]
    pub renders_dir: Option<PathBuf>,

    /// COCO manifest path; relative paths resolve against the renders directory.
    #[arg(long, env = "SYNTHBLEND_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Bounding box format: YOLO, COCO or none.
    #[arg(long = "bbox", env = "SYNTHBLEND_BBOX", default_value = "coco")]
    pub bbox_format: BboxFormat,

    #[arg(long, env = "SYNTHBLEND_COCO_BBOX", value_enum, default_value_t = CocoBbox::Standard)]
    pub coco_bbox: CocoBbox,

    #[arg(long, env = "SYNTHBLEND_IMG_SIZE")]
    pub img_size: Option<u32>,

    /// Camera distance: `4` or a range such as `3.5..6`.
    #[arg(long, env = "SYNTHBLEND_RADIUS")]
    pub radius: Option<RadiusSpec>,

    /// Polar angle range in radians (0 is straight overhead).
    #[arg(long, env = "SYNTHBLEND_PHI_MIN")]
    pub phi_min: Option<f64>,
    #[arg(long, env = "SYNTHBLEND_PHI_MAX")]
    pub phi_max: Option<f64>,

    /// Azimuth range in radians.
    #[arg(long, env = "SYNTHBLEND_THETA_MIN")]
    pub theta_min: Option<f64>,
    #[arg(long, env = "SYNTHBLEND_THETA_MAX")]
    pub theta_max: Option<f64>,

    #[arg(long, env = "SYNTHBLEND_SCALE_JITTER")]
    pub scale_jitter: Option<f64>,

    /// Jitter the scale in both directions instead of always enlarging.
    #[arg(long, env = "SYNTHBLEND_SIGNED_JITTER")]
    pub signed_jitter: bool,

    /// Aim the camera at `x,y,z` instead of the origin.
    #[arg(long, env = "SYNTHBLEND_LOOK_AT", value_parser = parse_vec3)]
    pub look_at: Option<DVec3>,

    /// Light offset from the camera as `x,y,z`.
    #[arg(long, env = "SYNTHBLEND_LIGHT_OFFSET", value_parser = parse_vec3, conflicts_with = "light_colocated")]
    pub light_offset: Option<DVec3>,

    /// Put the light exactly at the camera.
    #[arg(long, env = "SYNTHBLEND_LIGHT_COLOCATED")]
    pub light_colocated: bool,

    #[arg(long, env = "SYNTHBLEND_NO_SHADOW")]
    pub no_shadow: bool,

    #[arg(long, env = "SYNTHBLEND_SELECTION", value_enum, default_value_t = Selection::Random)]
    pub selection: Selection,

    /// Base seed; a random one is drawn and logged when absent.
    #[arg(long, env = "SYNTHBLEND_SEED")]
    pub seed: Option<u64>,

    /// Index of the first render job. Defaults to the first index after
    /// the images already in the COCO manifest, or 0.
    #[arg(long, env = "SYNTHBLEND_START_INDEX")]
    pub start_index: Option<u64>,

    /// Number of images to render.
    #[arg(short = 'n', long = "count", env = "SYNTHBLEND_COUNT")]
    pub render_count: Option<u64>,

    /// Concurrent render jobs.
    #[arg(short = 'w', long = "workers", env = "SYNTHBLEND_WORKERS")]
    pub render_workers: Option<usize>,

    #[arg(long, env = "SYNTHBLEND_AUGMENT_WORKERS")]
    pub augment_workers: Option<usize>,

    /// Per-render wall-clock limit in seconds.
    #[arg(long, env = "SYNTHBLEND_RENDER_TIMEOUT")]
    pub render_timeout: Option<u64>,

    /// Attempts per render job (2 means one retry).
    #[arg(long, env = "SYNTHBLEND_RENDER_ATTEMPTS")]
    pub render_attempts: Option<u32>,

    /// Rendered image format: png or jpg.
    #[arg(long, env = "SYNTHBLEND_FORMAT", default_value = "png")]
    pub format: ImageFormat,

    /// Renderer program.
    #[arg(long, env = "SYNTHBLEND_RENDERER")]
    pub renderer: Option<String>,

    /// Renderer argument (repeatable). Replaces the default arguments.
    #[arg(long = "renderer-arg", allow_hyphen_values = true)]
    pub renderer_args: Vec<String>,

    /// JSON file with the augmentation steps to apply.
    #[arg(long, env = "SYNTHBLEND_AUGMENT_FILE", conflicts_with = "no_augment")]
    pub augment_file: Option<PathBuf>,

    /// Skip augmentation entirely.
    #[arg(long, env = "SYNTHBLEND_NO_AUGMENT")]
    pub no_augment: bool,

    #[arg(long, value_enum, env = "SYNTHBLEND_STAGE", default_value_t = Stage::All)]
    pub stage: Stage,

    /// Log as JSON lines.
    #[arg(long, env = "SYNTHBLEND_LOG_JSON")]
    pub log_json: bool,
}

/// Parse `x,y,z`.
pub fn parse_vec3(s: &str) -> Result<DVec3, String> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid vector '{s}': {e}"))?;
    match parts.as_slice() {
        [x, y, z] => Ok(DVec3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got '{s}'")),
    }
}

impl Cli {
    /// Overlay the flags on the defaults. Does not validate.
    pub fn into_config(self) -> Result<Config, CoreError> {
        let mut config = Config::with_defaults(self.work_dir);

        if let Some(dir) = self.models_dir {
            config.models_dir = dir;
        }
        if let Some(dir) = self.backgrounds_dir {
            config.backgrounds_dir = dir;
        }
        if let Some(dir) = self.renders_dir {
            config.renders_dir = dir;
        }
        if let Some(path) = self.manifest {
            config.manifest_path = path;
        }

        config.bbox_format = self.bbox_format;
        config.coco_bbox = match self.coco_bbox {
            CocoBbox::Standard => CocoBboxConvention::Standard,
            CocoBbox::Legacy => CocoBboxConvention::Legacy,
        };
        if let Some(size) = self.img_size {
            config.img_size = size;
        }
        if let Some(radius) = self.radius {
            config.radius = radius;
        }
        config.phi_range = AngleRange::new(
            self.phi_min.unwrap_or(config.phi_range.min),
            self.phi_max.unwrap_or(config.phi_range.max),
        );
        config.theta_range = AngleRange::new(
            self.theta_min.unwrap_or(config.theta_range.min),
            self.theta_max.unwrap_or(config.theta_range.max),
        );
        if let Some(jitter) = self.scale_jitter {
            config.scale_jitter = jitter;
        }
        if self.signed_jitter {
            config.scale_jitter_mode = ScaleJitterMode::Signed;
        }
        if let Some(target) = self.look_at {
            config.orientation = OrientationMode::LookAt { target };
        }
        if self.light_colocated {
            config.light = LightPlacement::Colocated;
        } else if let Some(offset) = self.light_offset {
            config.light = LightPlacement::Offset(offset);
        }
        config.shadow_enabled = !self.no_shadow;
        config.selection = match self.selection {
            Selection::Index => SelectionPolicy::Index,
            Selection::Random => SelectionPolicy::Random,
        };
        config.seed = self.seed;

        if let Some(start) = self.start_index {
            config.start_index = start;
        }
        if let Some(count) = self.render_count {
            config.render_count = count;
        }
        if let Some(workers) = self.render_workers {
            config.render_workers = workers;
        }
        if let Some(workers) = self.augment_workers {
            config.augment_workers = workers;
        }
        if let Some(secs) = self.render_timeout {
            config.render_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.render_attempts {
            config.max_render_attempts = attempts;
        }
        config.image_format = self.format;
        if let Some(program) = self.renderer {
            config.renderer.program = program;
        }
        if !self.renderer_args.is_empty() {
            config.renderer.args = self.renderer_args;
        }

        if self.no_augment {
            config.augment.clear();
        } else if let Some(path) = self.augment_file {
            config.augment = read_augment_file(&path)?;
        }
        Ok(config)
    }
}

fn read_augment_file(path: &std::path::Path) -> Result<Vec<AugmentStep>, CoreError> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        CoreError::Configuration(format!(
            "Invalid augmentation file {}: {e}",
            path.display()
        ))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
