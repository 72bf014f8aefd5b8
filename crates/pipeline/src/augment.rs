//! Post-render augmentation: composite each render over a random
//! background, apply the configured pixel transforms, and overwrite the
//! render in place.

use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::Rng;
use synthblend_core::catalog::{has_extension, IMAGE_EXTENSIONS};
use synthblend_core::config::AugmentStep;
use synthblend_core::sampler::{job_rng, AUGMENT_STREAM};
use synthblend_core::types::JobIndex;
use synthblend_dataset::atomic::write_atomic;

const RENDER_PREFIX: &str = "render_";

/// Errors from augmenting one image.
#[derive(Debug, thiserror::Error)]
pub enum AugmentError {
    #[error("Image error on {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] synthblend_dataset::DatasetError),

    #[error("No background images are available for compositing")]
    NoBackgrounds,

    #[error("Augmentation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One render to augment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AugmentJob {
    pub index: JobIndex,
    pub image_path: PathBuf,
}

/// Augments one image in place.
pub trait Augmenter: Send + Sync {
    fn augment(&self, job: &AugmentJob) -> impl Future<Output = Result<(), AugmentError>> + Send;
}

/// Renders in `dir` eligible for augmentation (`render_*.png|jpg|jpeg`),
/// sorted by job index. The index comes from the file name.
pub fn discover_renders(dir: &Path) -> std::io::Result<Vec<AugmentJob>> {
    let mut jobs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !has_extension(&path, IMAGE_EXTENSIONS) {
            continue;
        }
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(RENDER_PREFIX))
            .and_then(|s| s.parse::<JobIndex>().ok());
        if let Some(index) = index {
            jobs.push(AugmentJob {
                index,
                image_path: path,
            });
        }
    }
    jobs.sort_by_key(|j| j.index);
    Ok(jobs)
}

// ---------------------------------------------------------------------------
// Pipeline augmenter
// ---------------------------------------------------------------------------

/// Background compositing followed by an ordered list of transforms.
///
/// Randomness comes from a per-job rng, so a given seed and job index
/// always produce the same result.
#[derive(Debug, Clone)]
pub struct PipelineAugmenter {
    backgrounds: Arc<Vec<PathBuf>>,
    steps: Arc<Vec<AugmentStep>>,
    seed: u64,
}

impl PipelineAugmenter {
    pub fn new(
        backgrounds: Vec<PathBuf>,
        steps: Vec<AugmentStep>,
        seed: u64,
    ) -> Result<Self, AugmentError> {
        if backgrounds.is_empty() {
            return Err(AugmentError::NoBackgrounds);
        }
        Ok(Self {
            backgrounds: Arc::new(backgrounds),
            steps: Arc::new(steps),
            seed,
        })
    }
}

impl Augmenter for PipelineAugmenter {
    async fn augment(&self, job: &AugmentJob) -> Result<(), AugmentError> {
        let backgrounds = Arc::clone(&self.backgrounds);
        let steps = Arc::clone(&self.steps);
        let seed = self.seed;
        let job_owned = job.clone();

        let bytes = tokio::task::spawn_blocking(move || {
            let mut rng = job_rng(seed, job_owned.index, AUGMENT_STREAM);
            augment_image(&job_owned.image_path, &backgrounds, &steps, &mut rng)
        })
        .await??;

        write_atomic(&job.image_path, &bytes).await?;
        tracing::debug!(
            index = job.index,
            path = %job.image_path.display(),
            "Augmented render",
        );
        Ok(())
    }
}

fn open_image(path: &Path) -> Result<DynamicImage, AugmentError> {
    image::open(path).map_err(|source| AugmentError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Load, composite, transform, and re-encode one render in its own format.
fn augment_image(
    path: &Path,
    backgrounds: &[PathBuf],
    steps: &[AugmentStep],
    rng: &mut StdRng,
) -> Result<Vec<u8>, AugmentError> {
    let render = open_image(path)?.to_rgba8();
    let background_path = backgrounds.choose(rng).ok_or(AugmentError::NoBackgrounds)?;
    let background = open_image(background_path)?;

    let mut canvas = composite(&render, &background);
    for step in steps {
        canvas = apply_step(canvas, step, rng);
    }

    let format = ImageFormat::from_path(path).map_err(|source| AugmentError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let encoded = match format {
        // JPEG has no alpha channel.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8()),
        _ => DynamicImage::ImageRgba8(canvas),
    };
    let mut bytes = Cursor::new(Vec::new());
    encoded
        .write_to(&mut bytes, format)
        .map_err(|source| AugmentError::Image {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(bytes.into_inner())
}

/// Alpha-composite `render` over `background` stretched to the render's size.
pub fn composite(render: &RgbaImage, background: &DynamicImage) -> RgbaImage {
    let (w, h) = render.dimensions();
    let mut canvas = imageops::resize(&background.to_rgba8(), w, h, FilterType::Triangle);
    imageops::overlay(&mut canvas, render, 0, 0);
    canvas
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

fn uniform<R: Rng>(rng: &mut R, lo: f32, hi: f32) -> f32 {
    lo + (hi - lo) * rng.random::<f32>()
}

fn symmetric<R: Rng>(rng: &mut R, limit: f32) -> f32 {
    uniform(rng, -limit, limit)
}

/// Apply one step, drawing its parameters from `rng`.
pub fn apply_step<R: Rng>(image: RgbaImage, step: &AugmentStep, rng: &mut R) -> RgbaImage {
    match *step {
        AugmentStep::GaussianBlur { sigma_max } => {
            let sigma = uniform(rng, 0.0, sigma_max.max(0.0));
            if sigma > 0.0 {
                imageops::blur(&image, sigma)
            } else {
                image
            }
        }
        AugmentStep::GaussNoise { var_min, var_max } => {
            let variance = uniform(rng, var_min, var_max).max(0.0);
            gauss_noise(image, variance.sqrt(), rng)
        }
        AugmentStep::HueSaturationValue {
            hue_shift,
            sat_shift,
            val_shift,
        } => {
            let dh = symmetric(rng, hue_shift.unsigned_abs() as f32);
            let ds = symmetric(rng, sat_shift.unsigned_abs() as f32);
            let dv = symmetric(rng, val_shift.unsigned_abs() as f32);
            let image = imageops::huerotate(&image, dh.round() as i32);
            let image = saturate(image, 1.0 + ds / 255.0);
            imageops::brighten(&image, dv.round() as i32)
        }
        AugmentStep::BrightnessContrast {
            brightness_limit,
            contrast_limit,
        } => {
            // `imageops::contrast` scales by ((100 + c) / 100)^2 around mid-grey.
            let factor = (1.0 + symmetric(rng, contrast_limit)).max(0.0);
            let image = imageops::contrast(&image, (factor.sqrt() - 1.0) * 100.0);
            let beta = symmetric(rng, brightness_limit) * 255.0;
            imageops::brighten(&image, beta.round() as i32)
        }
        AugmentStep::Rotate { limit_degrees } => {
            let angle = symmetric(rng, limit_degrees);
            rotate(&image, angle.to_radians())
        }
        AugmentStep::HorizontalFlip { p } => {
            let mut image = image;
            if rng.random_bool(p.clamp(0.0, 1.0)) {
                imageops::flip_horizontal_in_place(&mut image);
            }
            image
        }
    }
}

/// Add independent zero-mean Gaussian noise to every colour channel.
fn gauss_noise<R: Rng>(mut image: RgbaImage, std_dev: f32, rng: &mut R) -> RgbaImage {
    if std_dev <= 0.0 {
        return image;
    }
    for pixel in image.pixels_mut() {
        for c in &mut pixel.0[..3] {
            let noisy = *c as f32 + standard_normal(rng) * std_dev;
            *c = noisy.round().clamp(0.0, 255.0) as u8;
        }
    }
    image
}

/// Box-Muller.
fn standard_normal<R: Rng>(rng: &mut R) -> f32 {
    let u1 = rng.random::<f32>().max(f32::MIN_POSITIVE);
    let u2 = rng.random::<f32>();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

/// Scale each pixel's distance from its luma by `factor`; 0 is greyscale.
fn saturate(mut image: RgbaImage, factor: f32) -> RgbaImage {
    for pixel in image.pixels_mut() {
        let [r, g, b, _] = pixel.0.map(f32::from);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        for c in &mut pixel.0[..3] {
            *c = (luma + (*c as f32 - luma) * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
    image
}

/// Rotate about the image centre (nearest neighbour, edge pixels replicated).
fn rotate(image: &RgbaImage, radians: f32) -> RgbaImage {
    if radians == 0.0 {
        return image.clone();
    }
    let (w, h) = image.dimensions();
    let (cx, cy) = ((w as f32 - 1.0) / 2.0, (h as f32 - 1.0) / 2.0);
    let (sin, cos) = radians.sin_cos();
    let max_x = w.saturating_sub(1) as f32;
    let max_y = h.saturating_sub(1) as f32;

    RgbaImage::from_fn(w, h, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = (cos * dx + sin * dy + cx).round().clamp(0.0, max_x);
        let sy = (-sin * dx + cos * dy + cy).round().clamp(0.0, max_y);
        *image.get_pixel(sx as u32, sy as u32)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
