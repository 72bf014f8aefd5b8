//! Projection of object geometry into the image and annotation assembly.
//!
//! Pure functions of geometry and camera; nothing is held across calls.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::annotation::{
    bounding_box, convex_hull, to_coco, to_yolo, BoundingBox, CocoAnnotation, CocoEncoding,
    YoloBox,
};
use crate::geometry::Camera;

/// Points closer than this to the camera plane are treated as behind it.
const MIN_DEPTH: f64 = 1e-9;

/// World-space object vertices plus the camera that rendered them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometrySample {
    pub vertices: Vec<DVec3>,
    pub camera: Camera,
}

/// Project world-space points to normalized image coordinates
/// (origin bottom-left, `[0, 1]` spans the frame).
///
/// Coordinates are not clamped; points outside the frame fall outside
/// `[0, 1]`. Points behind the camera are dropped.
pub fn project(points: &[DVec3], camera: &Camera) -> Vec<DVec2> {
    let zoom = camera.intrinsics.zoom();
    let aspect = camera.intrinsics.aspect();
    points
        .iter()
        .filter_map(|p| {
            let c = camera.world_to_camera(*p);
            let depth = -c.z;
            if depth <= MIN_DEPTH {
                return None;
            }
            Some(DVec2::new(
                0.5 + (c.x / depth) * zoom,
                0.5 + (c.y / depth) * zoom * aspect,
            ))
        })
        .collect()
}

/// Clamp normalized points into the frame and convert them to pixel
/// coordinates with row 0 at the top.
pub fn to_pixels(points: &[DVec2], width: u32, height: u32) -> Vec<DVec2> {
    let size = DVec2::new(width as f64, height as f64);
    points
        .iter()
        .map(|p| {
            let p = p.clamp(DVec2::ZERO, DVec2::ONE);
            DVec2::new(p.x, 1.0 - p.y) * size
        })
        .collect()
}

/// Everything the exporters need for one rendered object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectAnnotation {
    pub bbox: BoundingBox,
    /// Convex outline of the projected vertices in pixel space.
    pub outline_px: Vec<DVec2>,
    /// True when no visible area remains after clamping.
    pub degenerate: bool,
    /// Some vertices lie behind the camera and were dropped. The box then
    /// covers only the vertices in front and can be too small: only
    /// vertices are known, not edges, so the clipped extent is lost. Such
    /// an object is not `degenerate` unless nothing remains.
    pub truncated: bool,
}

impl ObjectAnnotation {
    pub fn yolo(&self, class_id: usize) -> YoloBox {
        to_yolo(&self.bbox, class_id)
    }

    pub fn coco(
        &self,
        image_id: &str,
        category_id: usize,
        annotation_id: &str,
        encoding: &CocoEncoding,
    ) -> CocoAnnotation {
        to_coco(
            &self.bbox,
            &self.outline_px,
            image_id,
            category_id,
            annotation_id,
            encoding,
        )
    }
}

/// Project `sample` and build its bounding box and outline.
///
/// An object with no vertex in front of the camera gets
/// [`BoundingBox::EMPTY`]; a fully off-frame object gets a clamped
/// zero-area box. Both are flagged `degenerate`. An object straddling the
/// camera plane keeps the box of its visible vertices and is flagged
/// `truncated`.
pub fn annotate(sample: &GeometrySample) -> ObjectAnnotation {
    let intrinsics = &sample.camera.intrinsics;
    let projected = project(&sample.vertices, &sample.camera);
    let bbox = bounding_box(&projected).unwrap_or(BoundingBox::EMPTY);
    let pixels = to_pixels(&projected, intrinsics.resolution_x, intrinsics.resolution_y);
    let outline_px = convex_hull(&pixels);

    ObjectAnnotation {
        degenerate: bbox.is_degenerate(),
        truncated: !projected.is_empty() && projected.len() < sample.vertices.len(),
        bbox,
        outline_px,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::shoelace_area;
    use crate::config::CocoBboxConvention;
    use crate::geometry::{fixed_orientation, spherical_to_cartesian, CameraIntrinsics};

    const EPS: f64 = 1e-9;

    /// Camera on the +Z axis at distance 4, looking at the origin.
    fn overhead_camera(img_size: u32) -> Camera {
        Camera {
            position: DVec3::new(0.0, 0.0, 4.0),
            rotation: fixed_orientation(0.0, -std::f64::consts::FRAC_PI_2),
            intrinsics: CameraIntrinsics::square(img_size),
        }
    }

    fn cube(half: f64) -> Vec<DVec3> {
        let mut v = Vec::new();
        for x in [-half, half] {
            for y in [-half, half] {
                for z in [-half, half] {
                    v.push(DVec3::new(x, y, z));
                }
            }
        }
        v
    }

    #[test]
    fn origin_projects_to_frame_center() {
        let camera = Camera {
            position: spherical_to_cartesian(0.8, 2.1, 4.0),
            rotation: fixed_orientation(0.8, 2.1),
            intrinsics: CameraIntrinsics::square(512),
        };
        let p = project(&[DVec3::ZERO], &camera);
        assert_eq!(p.len(), 1);
        assert!((p[0] - DVec2::splat(0.5)).length() < EPS);
    }

    #[test]
    fn overhead_axes_map_to_image_axes() {
        let camera = overhead_camera(100);
        let p = project(&[DVec3::new(1.0, 0.0, 0.0), DVec3::new(0.0, 1.0, 0.0)], &camera);
        let zoom = 50.0 / 36.0;
        assert!((p[0].x - (0.5 + zoom / 4.0)).abs() < EPS);
        assert!((p[0].y - 0.5).abs() < EPS);
        assert!((p[1].y - (0.5 + zoom / 4.0)).abs() < EPS);
    }

    #[test]
    fn points_behind_camera_are_dropped() {
        let camera = overhead_camera(100);
        let p = project(&[DVec3::new(0.0, 0.0, 5.0), DVec3::ZERO], &camera);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn pixels_are_clamped_and_flipped() {
        let px = to_pixels(&[DVec2::new(0.25, 0.75), DVec2::new(-1.0, 2.0)], 200, 100);
        assert_eq!(px[0], DVec2::new(50.0, 25.0));
        assert_eq!(px[1], DVec2::new(0.0, 0.0));
    }

    #[test]
    fn centered_cube_is_symmetric() {
        let ann = annotate(&GeometrySample {
            vertices: cube(0.5),
            camera: overhead_camera(256),
        });
        assert!(!ann.degenerate);
        assert!((ann.bbox.min_x + ann.bbox.max_x - 1.0).abs() < EPS);
        assert!((ann.bbox.min_y + ann.bbox.max_y - 1.0).abs() < EPS);

        let yolo = ann.yolo(0);
        assert!((yolo.center_x - 0.5).abs() < EPS);
        assert!((yolo.center_y - 0.5).abs() < EPS);

        let encoding = CocoEncoding {
            width: 256,
            height: 256,
            convention: CocoBboxConvention::Standard,
        };
        let coco = ann.coco("00001", 0, "00001", &encoding);
        let box_area = coco.bbox[2] * coco.bbox[3];
        assert!((coco.area - box_area).abs() < 1e-6);
        assert!((coco.area - shoelace_area(&ann.outline_px)).abs() < EPS);
    }

    #[test]
    fn off_frame_object_is_degenerate() {
        let vertices = cube(0.1)
            .into_iter()
            .map(|v| v + DVec3::new(50.0, 0.0, 0.0))
            .collect();
        let ann = annotate(&GeometrySample {
            vertices,
            camera: overhead_camera(64),
        });
        assert!(ann.degenerate);
        assert_eq!(ann.bbox.min_x, 1.0);
        assert_eq!(ann.bbox.max_x, 1.0);
    }

    #[test]
    fn object_behind_camera_gets_empty_box() {
        let ann = annotate(&GeometrySample {
            vertices: vec![DVec3::new(0.0, 0.0, 10.0)],
            camera: overhead_camera(64),
        });
        assert!(ann.degenerate);
        assert!(!ann.truncated);
        assert_eq!(ann.bbox, BoundingBox::EMPTY);
        assert!(ann.outline_px.is_empty());
    }

    #[test]
    fn object_straddling_camera_plane_is_truncated() {
        // Half the vertices sit above the camera at z = 4.
        let vertices = cube(1.0)
            .into_iter()
            .map(|v| v + DVec3::new(0.0, 0.0, 4.0))
            .collect();
        let ann = annotate(&GeometrySample {
            vertices,
            camera: overhead_camera(64),
        });
        assert!(ann.truncated);
        assert!(!ann.degenerate);

        let whole = annotate(&GeometrySample {
            vertices: cube(0.5),
            camera: overhead_camera(64),
        });
        assert!(!whole.truncated);
    }
}
