//! Rotation helpers: orientation-prior composition, Y-X-Z Euler extraction
//! and angular differences.

use nalgebra::{Rotation3, UnitQuaternion, Vector3};

/// Compose the per-frame orientation prior `[about_x, about_y, about_z]`
/// (radians) into a rotation. Composition order is yaw-less Y then X then Z,
/// matching the device convention of the orientation source.
pub fn orientation_to_rotation(orientation: &[f64; 3]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), orientation[1])
        * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), orientation[0])
        * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), orientation[2])
}

/// Decompose a rotation as `Ry(a) · Rx(b) · Rz(c)`, returning `(a, b, c)` in
/// radians.
pub fn euler_yxz(q: &UnitQuaternion<f64>) -> (f64, f64, f64) {
    let m: Rotation3<f64> = q.to_rotation_matrix();
    let m = m.matrix();
    // With r = Ry(a)·Rx(b)·Rz(c): m[(1,2)] = -sin(b), m[(0,2)] = sin(a)cos(b),
    // m[(2,2)] = cos(a)cos(b), m[(1,0)] = cos(b)sin(c), m[(1,1)] = cos(b)cos(c).
    let b = (-m[(1, 2)]).asin();
    let a = m[(0, 2)].atan2(m[(2, 2)]);
    let c = m[(1, 0)].atan2(m[(1, 1)]);
    (a, b, c)
}

/// Euler Y-X-Z angles of `q` in degrees, ordered `[about_x, about_y, about_z]`
/// to match the orientation-prior layout.
pub fn quat_to_euler_deg(q: &UnitQuaternion<f64>) -> [f64; 3] {
    let (a, b, c) = euler_yxz(q);
    let scl = 180.0 / std::f64::consts::PI;
    [b * scl, a * scl, c * scl]
}

/// Magnitude of the rotation taking `q1` to `q2`, in degrees.
pub fn angular_difference_deg(q1: &UnitQuaternion<f64>, q2: &UnitQuaternion<f64>) -> f64 {
    let diff = q1.inverse() * q2;
    diff.angle() * 180.0 / std::f64::consts::PI
}
