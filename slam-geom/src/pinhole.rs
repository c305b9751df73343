//! Pinhole camera model over centered keypoint coordinates.

use nalgebra::geometry::Point2;
use nalgebra::{UnitQuaternion, Vector3};

use crate::{world_to_camera, Pose};

/// Depth at which the matcher places a unit direction before rotating it into
/// the other frame. Any positive value works; this matches the keypoint
/// magnitudes the gate thresholds were tuned against.
const GATE_DEPTH: f64 = 100.0;

/// Pinhole intrinsics. The pose pipeline always runs with `cx = cy = 0`
/// because keypoints are centered at construction; the principal point is
/// kept for embedders projecting into raw pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeModel {
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeModel {
    pub fn new(focal: f64, cx: f64, cy: f64) -> Self {
        PinholeModel { focal, cx, cy }
    }

    /// Intrinsics with a zero principal point, for centered coordinates.
    pub fn centered(focal: f64) -> Self {
        PinholeModel::new(focal, 0.0, 0.0)
    }

    /// Project a world point. `None` when the point is behind the camera.
    pub fn project(&self, pose: &Pose, point: &Vector3<f64>) -> Option<Point2<f64>> {
        let cam = world_to_camera(pose, point);
        if cam.z <= 0.0 {
            None
        } else {
            Some(self.camera_to_image(&cam))
        }
    }

    /// Project a world point without the behind-camera guard. The bundle
    /// adjuster evaluates residuals on whatever side the iterate lands.
    pub fn project_unchecked(&self, pose: &Pose, point: &Vector3<f64>) -> Point2<f64> {
        let cam = world_to_camera(pose, point);
        self.camera_to_image(&cam)
    }

    /// Perspective division of a camera-frame point.
    pub fn camera_to_image(&self, cam: &Vector3<f64>) -> Point2<f64> {
        Point2::new(
            self.focal * cam.x / cam.z + self.cx,
            self.focal * cam.y / cam.z + self.cy,
        )
    }

    /// Unproject centered image coordinates at the given depth into the world.
    pub fn unproject(&self, pose: &Pose, x: f64, y: f64, depth: f64) -> Vector3<f64> {
        let cam = Vector3::new(
            x * depth / self.focal,
            y * depth / self.focal,
            depth,
        );
        pose.trans + pose.rot * cam
    }

    /// Where a point seen at centered coordinates `(x, y)` in another frame
    /// is expected in this frame under the pure-rotation hypothesis
    /// `rot_diff = q_this⁻¹ · q_other`.
    pub fn rotation_compensated(
        &self,
        rot_diff: &UnitQuaternion<f64>,
        x: f64,
        y: f64,
    ) -> Point2<f64> {
        let dir = Vector3::new(
            x * GATE_DEPTH / self.focal,
            y * GATE_DEPTH / self.focal,
            GATE_DEPTH,
        );
        self.camera_to_image(&(rot_diff * dir))
    }
}
