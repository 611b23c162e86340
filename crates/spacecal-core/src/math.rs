//! Mathematical type definitions and rotation conversions.
//!
//! All downstream algebra runs on these aliases; the scalar type is `f64`
//! throughout. Euler angles follow the ZYX (yaw-pitch-roll) decomposition
//! used by the calibration profile, stored in degrees with component order
//! `(z, y, x)` — index 1 is the yaw about the vertical axis.

use nalgebra::{Isometry3, Matrix3, Rotation3, UnitQuaternion, Vector3};

/// Scalar type used throughout the workspace.
pub type Real = f64;

/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;
/// Unit quaternion with [`Real`] components.
pub type Quat = UnitQuaternion<Real>;
/// 3D rigid transform (SE(3)) using [`Real`].
pub type Iso3 = Isometry3<Real>;

/// Rotation axis of `r` scaled by `2·sin θ`, read off the skew-symmetric
/// part of the matrix. Not normalized; the norm vanishes for angles near
/// 0 and π, which callers use to reject degenerate rotations.
pub fn axis_from_rotation_matrix(r: &Mat3) -> Vec3 {
    Vec3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    )
}

/// Rotation angle of `r` in radians.
///
/// The `acos` argument is clamped into `[-1, 1]` to absorb floating-point
/// slack in the trace of near-identity and near-π rotations.
pub fn angle_from_rotation_matrix(r: &Mat3) -> Real {
    ((r.trace() - 1.0) * 0.5).clamp(-1.0, 1.0).acos()
}

/// ZYX Euler angles of a rotation matrix, in degrees, component order
/// `(z, y, x)`.
pub fn euler_deg_from_matrix(r: &Mat3) -> Vec3 {
    let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*r));
    let (roll, pitch, yaw) = q.euler_angles();
    Vec3::new(yaw.to_degrees(), pitch.to_degrees(), roll.to_degrees())
}

/// Unit quaternion for ZYX Euler angles in degrees, component order
/// `(z, y, x)`. Inverse of [`euler_deg_from_matrix`].
pub fn quat_from_euler_deg(e: &Vec3) -> Quat {
    Quat::from_euler_angles(e.z.to_radians(), e.y.to_radians(), e.x.to_radians())
}
