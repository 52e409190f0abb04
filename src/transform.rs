use nalgebra::{
    Isometry3, Matrix3, Matrix4, Quaternion, Rotation3, Translation3, UnitQuaternion, Vector3,
    Vector6,
};

use std::ops;

/// A rigid body transform in 3D space (an element of SE(3)).
///
/// This wraps `Isometry3` from nalgebra. Poses are sensor-to-world and
/// compose right-to-left: `world_from_cam_new = world_from_cam_prev * increment`.
#[derive(Clone, Debug)]
pub struct Transform(pub Isometry3<f64>);

impl Default for Transform {
    fn default() -> Self {
        Self::eye()
    }
}

impl Transform {
    /// Create a new transform with zero translation and zero rotation.
    pub fn eye() -> Self {
        Self(Isometry3::identity())
    }

    /// Create a new transform from a translation vector and a rotation quaternion.
    ///
    /// The quaternion does not need to be normalized.
    pub fn new(xyz: &Vector3<f64>, rotation: Quaternion<f64>) -> Self {
        Self(Isometry3::from_parts(
            Translation3::new(xyz[0], xyz[1], xyz[2]),
            UnitQuaternion::from_quaternion(rotation),
        ))
    }

    /// Create a transform from a translation and an already-normalized rotation.
    pub fn from_parts(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self(Isometry3::from_parts(Translation3::from(translation), rotation))
    }

    /// Create a transform from a 4x4 homogeneous matrix.
    pub fn from_matrix4(matrix: &Matrix4<f64>) -> Self {
        let translation = Translation3::new(matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)]);
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(
            &matrix.fixed_slice::<3, 3>(0, 0).into_owned(),
        ));
        Self(Isometry3::from_parts(translation, rotation))
    }

    fn exp_so3(omega: &Vector3<f64>) -> (f64, UnitQuaternion<f64>) {
        // https://github.com/strasdat/Sophus/blob/main-1.x/sophus/so3.hpp
        const EPSILON: f64 = 1e-10;
        let theta_sq = omega.norm_squared();

        let (theta, imag_factor, real_factor) = if theta_sq < EPSILON * EPSILON {
            let theta_po4 = theta_sq * theta_sq;
            (
                0.0,
                0.5 - (1.0 / 48.0) * theta_sq + (1.0 / 3840.0) * theta_po4,
                1.0 - (1.0 / 8.0) * theta_sq + (1.0 / 384.0) * theta_po4,
            )
        } else {
            let theta = theta_sq.sqrt();
            let half_theta = 0.5 * theta;
            (theta, half_theta.sin() / theta, half_theta.cos())
        };

        (
            theta,
            UnitQuaternion::from_quaternion(Quaternion::new(
                real_factor,
                imag_factor * omega[0],
                imag_factor * omega[1],
                imag_factor * omega[2],
            )),
        )
    }

    /// The se(3) exponential map. Builds a transform from a 6D tangent vector
    /// `[x, y, z, rx, ry, rz]` where the first three entries are the translation
    /// part and the last three the rotation as a scaled axis.
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        const EPSILON: f64 = 1e-10;

        let omega = Vector3::new(tangent[3], tangent[4], tangent[5]);
        let (theta, rotation) = Self::exp_so3(&omega);
        let theta_sq = theta * theta;

        let translation = {
            let left_jacobian = {
                let big_omega = omega.cross_matrix();
                if theta_sq < EPSILON {
                    Matrix3::identity() + (big_omega * 0.5)
                } else {
                    let big_omega_squared = big_omega * big_omega;
                    Matrix3::identity()
                        + (1.0 - theta.cos()) / theta_sq * big_omega
                        + (theta - theta.sin()) / (theta_sq * theta) * big_omega_squared
                }
            };
            left_jacobian * Vector3::new(tangent[0], tangent[1], tangent[2])
        };

        Self(Isometry3::from_parts(translation.into(), rotation))
    }

    /// Transforms a 3D point.
    pub fn transform_point(&self, rhs: &Vector3<f64>) -> Vector3<f64> {
        self.0.rotation * rhs + self.0.translation.vector
    }

    /// Inverts the transform.
    pub fn inverse(&self) -> Self {
        Self(self.0.inverse())
    }

    /// Returns the translation part.
    pub fn translation(&self) -> Vector3<f64> {
        self.0.translation.vector
    }

    /// Returns the rotation part.
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.0.rotation
    }

    /// Returns the rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.0.rotation.angle()
    }

    /// Decoupled SE(3) error between two poses: translation difference and
    /// rotation difference as a scaled axis, both of `self.inverse() * other`.
    /// Zero iff the poses coincide.
    pub fn error_to(&self, other: &Transform) -> Vector6<f64> {
        let diff = self.inverse().0 * other.0;
        let rot = diff.rotation.scaled_axis();
        Vector6::new(
            diff.translation.vector[0],
            diff.translation.vector[1],
            diff.translation.vector[2],
            rot[0],
            rot[1],
            rot[2],
        )
    }
}

impl ops::Mul<&Transform> for &Transform {
    type Output = Transform;

    /// Composes two transforms, `rhs` applied first.
    fn mul(self, rhs: &Transform) -> Self::Output {
        Transform(self.0 * rhs.0)
    }
}

impl From<&Transform> for Matrix4<f64> {
    fn from(transform: &Transform) -> Self {
        transform.0.to_homogeneous()
    }
}

impl From<&Matrix4<f64>> for Transform {
    fn from(matrix: &Matrix4<f64>) -> Self {
        Transform::from_matrix4(matrix)
    }
}
