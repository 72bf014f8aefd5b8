//! Bounding boxes and their YOLO / COCO encodings.
//!
//! Normalized coordinates follow camera-space convention: origin at the
//! bottom-left, y pointing up. Image-space outputs (YOLO centers, COCO
//! pixels) flip y so row 0 is the top of the image.

use std::fmt;
use std::str::FromStr;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::config::CocoBboxConvention;
use crate::error::CoreError;

/// Decimal places written in YOLO sidecar lines.
pub const YOLO_PRECISION: usize = 6;

// ---------------------------------------------------------------------------
// Bounding box
// ---------------------------------------------------------------------------

/// Axis-aligned box in normalized coordinates. Every field is in `[0, 1]`
/// and `min <= max` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Zero-area box at the origin, used when nothing is visible.
    pub const EMPTY: Self = Self {
        min_x: 0.0,
        max_x: 0.0,
        min_y: 0.0,
        max_y: 0.0,
    };

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// True when the box has no area, e.g. the object is fully off-frame.
    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    /// Pixel-space corners `(left, top, right, bottom)` for an image of
    /// `width × height`, with y flipped so the top row is 0.
    pub fn to_pixels(&self, width: u32, height: u32) -> [f64; 4] {
        let (w, h) = (width as f64, height as f64);
        [
            self.min_x * w,
            (1.0 - self.max_y) * h,
            self.max_x * w,
            (1.0 - self.min_y) * h,
        ]
    }
}

/// Bounding box of `points`, each coordinate clamped to `[0, 1]`.
///
/// Returns `None` for an empty point set.
pub fn bounding_box(points: &[DVec2]) -> Option<BoundingBox> {
    let first = points.first()?;
    let (mut min, mut max) = (*first, *first);
    for p in &points[1..] {
        min = min.min(*p);
        max = max.max(*p);
    }
    let min = min.clamp(DVec2::ZERO, DVec2::ONE);
    let max = max.clamp(DVec2::ZERO, DVec2::ONE);
    Some(BoundingBox {
        min_x: min.x,
        max_x: max.x,
        min_y: min.y,
        max_y: max.y,
    })
}

// ---------------------------------------------------------------------------
// YOLO
// ---------------------------------------------------------------------------

/// One YOLO label: class plus normalized center and size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YoloBox {
    pub class_id: usize,
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
}

impl YoloBox {
    /// Reconstruct the normalized bounding box this label encodes.
    pub fn to_bbox(&self) -> BoundingBox {
        let mid_y = 1.0 - self.center_y;
        BoundingBox {
            min_x: self.center_x - self.width / 2.0,
            max_x: self.center_x + self.width / 2.0,
            min_y: mid_y - self.height / 2.0,
            max_y: mid_y + self.height / 2.0,
        }
    }
}

/// Encode `bbox` as a YOLO label; `center_y` is flipped into image space.
pub fn to_yolo(bbox: &BoundingBox, class_id: usize) -> YoloBox {
    let width = bbox.width().max(0.0);
    let height = bbox.height().max(0.0);
    YoloBox {
        class_id,
        center_x: bbox.min_x + width / 2.0,
        center_y: 1.0 - (bbox.min_y + height / 2.0),
        width,
        height,
    }
}

impl fmt::Display for YoloBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = YOLO_PRECISION;
        write!(
            f,
            "{} {:.p$} {:.p$} {:.p$} {:.p$}",
            self.class_id, self.center_x, self.center_y, self.width, self.height
        )
    }
}

impl FromStr for YoloBox {
    type Err = CoreError;

    /// Parse a sidecar line `class cx cy w h`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CoreError::Validation(format!(
                "YOLO line must have 5 fields, got {}",
                fields.len()
            )));
        }
        let class_id = fields[0].parse::<usize>().map_err(|_| {
            CoreError::Validation(format!("Invalid YOLO class id '{}'", fields[0]))
        })?;
        let mut values = [0.0f64; 4];
        for (slot, raw) in values.iter_mut().zip(&fields[1..]) {
            let v = raw
                .parse::<f64>()
                .map_err(|_| CoreError::Validation(format!("Invalid YOLO value '{raw}'")))?;
            if !(0.0..=1.0).contains(&v) {
                return Err(CoreError::Validation(format!(
                    "YOLO value {v} is outside [0, 1]"
                )));
            }
            *slot = v;
        }
        Ok(Self {
            class_id,
            center_x: values[0],
            center_y: values[1],
            width: values[2],
            height: values[3],
        })
    }
}

// ---------------------------------------------------------------------------
// COCO
// ---------------------------------------------------------------------------

/// A COCO category entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub supercategory: String,
    pub id: usize,
    pub name: String,
}

/// A COCO annotation entry. Field order matches the exported schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAnnotation {
    /// One polygon, flattened as `[x0, y0, x1, y1, …]` in pixels.
    pub segmentation: Vec<Vec<f64>>,
    pub area: f64,
    pub iscrowd: u8,
    pub image_id: String,
    pub bbox: [f64; 4],
    pub category_id: usize,
    pub id: String,
}

/// Image dimensions and bbox layout used when encoding COCO annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CocoEncoding {
    pub width: u32,
    pub height: u32,
    pub convention: CocoBboxConvention,
}

/// Encode a COCO annotation.
///
/// `polygon_px` is the ordered outline in pixel space; its shoelace area
/// becomes `area`.
pub fn to_coco(
    bbox: &BoundingBox,
    polygon_px: &[DVec2],
    image_id: &str,
    category_id: usize,
    annotation_id: &str,
    encoding: &CocoEncoding,
) -> CocoAnnotation {
    let [left, top, right, bottom] = bbox.to_pixels(encoding.width, encoding.height);
    let (width, height) = (right - left, bottom - top);
    let bbox = match encoding.convention {
        CocoBboxConvention::Standard => [left, top, width, height],
        CocoBboxConvention::Legacy => [right, bottom, width, height],
    };
    let flat: Vec<f64> = polygon_px.iter().flat_map(|p| [p.x, p.y]).collect();

    CocoAnnotation {
        segmentation: vec![flat],
        area: shoelace_area(polygon_px),
        iscrowd: 0,
        image_id: image_id.to_string(),
        bbox,
        category_id,
        id: annotation_id.to_string(),
    }
}

/// Polygon area via the shoelace formula. Orientation-independent;
/// fewer than three points give 0.
pub fn shoelace_area(points: &[DVec2]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.perp_dot(*b))
        .sum();
    twice.abs() / 2.0
}

/// Convex hull in counter-clockwise order (monotone chain). Collinear
/// points are dropped.
pub fn convex_hull(points: &[DVec2]) -> Vec<DVec2> {
    let mut sorted: Vec<DVec2> = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    sorted.dedup();
    if sorted.len() < 3 {
        return sorted;
    }

    let cross = |o: DVec2, a: DVec2, b: DVec2| (a - o).perp_dot(b - o);
    let mut hull: Vec<DVec2> = Vec::with_capacity(sorted.len() * 2);
    for pass in [sorted.clone(), sorted.into_iter().rev().collect()] {
        let start = hull.len();
        for p in pass {
            while hull.len() >= start + 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
                hull.pop();
            }
            hull.push(p);
        }
        hull.pop();
    }
    hull
}

/// Annotation in whichever format the batch exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum Annotation {
    Yolo(YoloBox),
    Coco(CocoAnnotation),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
