//! Spherical coordinates, camera orientation, and camera models.
//!
//! Rotations are XYZ Euler triples in radians, applied extrinsically
//! (X first, then Y, then Z). An unrotated camera looks down its local
//! -Z axis with +Y up, which is the convention the renderer uses.

use std::f64::consts::{FRAC_PI_2, TAU};

use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

/// Below this length a direction vector is treated as zero.
const DIRECTION_EPSILON: f64 = 1e-12;

/// Default lens focal length in millimetres.
pub const DEFAULT_FOCAL_LENGTH_MM: f64 = 50.0;

/// Default sensor width in millimetres (horizontal sensor fit).
pub const DEFAULT_SENSOR_WIDTH_MM: f64 = 36.0;

// ---------------------------------------------------------------------------
// Spherical coordinates
// ---------------------------------------------------------------------------

/// A point expressed as polar angle, azimuth, and distance from the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spherical {
    /// Polar angle measured from +Z, in `[0, π]`.
    pub phi: f64,
    /// Azimuth measured from +X towards +Y, in `[0, 2π)`.
    pub theta: f64,
    pub radius: f64,
}

/// `x = r·sinφ·cosθ`, `y = r·sinφ·sinθ`, `z = r·cosφ`.
pub fn spherical_to_cartesian(phi: f64, theta: f64, radius: f64) -> DVec3 {
    DVec3::new(
        radius * phi.sin() * theta.cos(),
        radius * phi.sin() * theta.sin(),
        radius * phi.cos(),
    )
}

/// Inverse of [`spherical_to_cartesian`].
///
/// The origin maps to `phi = theta = radius = 0`. On the Z axis the azimuth
/// is undefined and reported as 0.
pub fn cartesian_to_spherical(point: DVec3) -> Spherical {
    let radius = point.length();
    if radius < DIRECTION_EPSILON {
        return Spherical {
            phi: 0.0,
            theta: 0.0,
            radius: 0.0,
        };
    }
    let phi = (point.z / radius).clamp(-1.0, 1.0).acos();
    let theta = point.y.atan2(point.x).rem_euclid(TAU);
    Spherical { phi, theta, radius }
}

// ---------------------------------------------------------------------------
// Orientation
// ---------------------------------------------------------------------------

/// Rotation for a camera sitting on a sphere around the origin and looking
/// at the origin: `(phi, 0, theta + π/2)`.
pub fn fixed_orientation(phi: f64, theta: f64) -> DVec3 {
    DVec3::new(phi, 0.0, theta + FRAC_PI_2)
}

/// Rotation that points the camera's -Z axis from `eye` towards `target`
/// with zero roll.
///
/// Returns `None` when `eye` and `target` coincide. A vertical view
/// direction has no defined yaw and gets yaw 0.
pub fn look_at(eye: DVec3, target: DVec3) -> Option<DVec3> {
    let direction = target - eye;
    let length = direction.length();
    if length < DIRECTION_EPSILON {
        return None;
    }
    let u = direction / length;

    let pitch = (-u.z).clamp(-1.0, 1.0).acos();
    let horizontal = u.x.hypot(u.y);
    let yaw = if horizontal < DIRECTION_EPSILON {
        0.0
    } else {
        (-u.x).atan2(u.y)
    };
    Some(DVec3::new(pitch, 0.0, yaw))
}

/// Rotation matrix for an extrinsic XYZ Euler triple (`Rz · Ry · Rx`).
pub fn rotation_matrix(euler: DVec3) -> DMat3 {
    DMat3::from_rotation_z(euler.z) * DMat3::from_rotation_y(euler.y) * DMat3::from_rotation_x(euler.x)
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

/// Pinhole camera intrinsics with horizontal sensor fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub focal_length_mm: f64,
    pub sensor_width_mm: f64,
    pub resolution_x: u32,
    pub resolution_y: u32,
}

impl CameraIntrinsics {
    /// Default lens for a square image of `img_size` pixels.
    pub fn square(img_size: u32) -> Self {
        Self {
            focal_length_mm: DEFAULT_FOCAL_LENGTH_MM,
            sensor_width_mm: DEFAULT_SENSOR_WIDTH_MM,
            resolution_x: img_size,
            resolution_y: img_size,
        }
    }

    /// Ratio of focal length to sensor width.
    pub fn zoom(&self) -> f64 {
        self.focal_length_mm / self.sensor_width_mm
    }

    /// `resolution_x / resolution_y`, or 1 for an empty resolution.
    pub fn aspect(&self) -> f64 {
        if self.resolution_y == 0 {
            1.0
        } else {
            self.resolution_x as f64 / self.resolution_y as f64
        }
    }
}

/// Camera extrinsics plus intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub position: DVec3,
    /// XYZ Euler rotation in radians.
    pub rotation: DVec3,
    pub intrinsics: CameraIntrinsics,
}

impl Camera {
    /// Transform a world-space point into camera space.
    ///
    /// In camera space the camera looks down -Z, so points in front of it
    /// have negative `z`.
    pub fn world_to_camera(&self, point: DVec3) -> DVec3 {
        rotation_matrix(self.rotation).transpose() * (point - self.position)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
