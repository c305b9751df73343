//! Pose value type and pinhole projection kernel.
//!
//! Pure and stateless; the only failure mode is a point behind the camera,
//! which is signalled through `Option` / the [behind_camera] pair.

#![deny(rust_2018_idioms)]

use nalgebra::geometry::Point2;
use nalgebra::{UnitQuaternion, Vector3};

mod pinhole;
mod rotation;

pub use pinhole::PinholeModel;
pub use rotation::{
    angular_difference_deg, euler_yxz, orientation_to_rotation, quat_to_euler_deg,
};

/// Camera pose: translation plus unit-quaternion rotation, mapping the camera
/// frame into the world frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    pub trans: Vector3<f64>,
    pub rot: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(trans: Vector3<f64>, rot: UnitQuaternion<f64>) -> Self {
        Pose { trans, rot }
    }

    pub fn identity() -> Self {
        Pose {
            trans: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.trans.iter().all(|v| v.is_finite())
            && self.rot.as_ref().coords.iter().all(|v| v.is_finite())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Pose::identity()
    }
}

/// Transform a world point into the camera frame of `pose`.
pub fn world_to_camera(pose: &Pose, point: &Vector3<f64>) -> Vector3<f64> {
    pose.rot.inverse() * (point - pose.trans)
}

/// Whether `point` lies behind the camera of `pose`, together with the
/// camera-frame coordinates used for the decision.
pub fn behind_camera(pose: &Pose, point: &Vector3<f64>) -> (bool, Vector3<f64>) {
    let cam = world_to_camera(pose, point);
    (cam.z <= 0.0, cam)
}

/// Euclidean gap between a stored 2D location and a projected one.
pub fn pixel_gap(x: f64, y: f64, px: f64, py: f64) -> f64 {
    let p = Point2::new(x, y) - Point2::new(px, py);
    p.norm()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_world_to_camera_identity() {
        let pose = Pose::identity();
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(world_to_camera(&pose, &p), p);
    }

    #[test]
    fn test_behind_camera() {
        let pose = Pose::identity();
        assert!(behind_camera(&pose, &Vector3::new(0.0, 0.0, -1.0)).0);
        assert!(!behind_camera(&pose, &Vector3::new(0.0, 0.0, 1.0)).0);

        // A camera rotated 180 degrees about y sees the -z half space.
        let pose = Pose::new(
            Vector3::zeros(),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::PI),
        );
        assert!(!behind_camera(&pose, &Vector3::new(0.0, 0.0, -1.0)).0);
    }

    #[test]
    fn test_pixel_gap() {
        assert_relative_eq!(pixel_gap(0.0, 0.0, 3.0, 4.0), 5.0);
    }
}
