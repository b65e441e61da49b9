//! Rigid camera pose (world-to-camera transform).
//!
//! A [`Pose`] maps world coordinates into a camera frame:
//! `x_cam = R * x_world + t`. The first keyframe of a reconstruction is
//! anchored at [`Pose::identity`].

use nalgebra::{Matrix3, Matrix3x4, UnitQuaternion, Vector2, Vector3};

/// World-to-camera rigid transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Rotation part (world → camera).
    pub rotation: UnitQuaternion<f64>,
    /// Translation part (world → camera).
    pub translation: Vector3<f64>,
}

impl Pose {
    /// The reference pose: camera frame coincides with the world frame.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build a pose from a rotation matrix and translation vector.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(rotation),
        );
        Self {
            rotation,
            translation,
        }
    }

    /// Inverse transform (camera → world).
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Composition: `self.compose(other)` maps `x` to `self(other(x))`.
    pub fn compose(&self, other: &Pose) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a world point into this camera's frame.
    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Depth of a world point in this camera (z after transforming).
    pub fn depth_of(&self, point: &Vector3<f64>) -> f64 {
        self.transform(point).z
    }

    /// Project a world point to normalized image coordinates.
    ///
    /// Returns `None` when the point lies on or behind the principal
    /// plane (non-positive depth).
    pub fn project(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        let cam = self.transform(point);
        if cam.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(cam.x / cam.z, cam.y / cam.z))
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// The 3x4 projection matrix `[R | t]` in calibrated coordinates.
    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        let r = self.rotation_matrix();
        let mut p = Matrix3x4::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        p.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        p
    }

    /// Camera center in world coordinates (`-R^T t`).
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_leaves_points_unchanged() {
        let pose = Pose::identity();
        let p = Vector3::new(1.0, -2.0, 3.0);
        assert_relative_eq!(pose.transform(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let rotation = UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3);
        let pose = Pose {
            rotation,
            translation: Vector3::new(0.5, -1.0, 2.0),
        };
        let p = Vector3::new(1.0, 2.0, 5.0);

        let roundtrip = pose.inverse().transform(&pose.transform(&p));
        assert_relative_eq!(roundtrip, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_transform() {
        let a = Pose {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
            translation: Vector3::new(1.0, 0.0, 0.0),
        };
        let b = Pose {
            rotation: UnitQuaternion::from_euler_angles(0.2, 0.0, 0.0),
            translation: Vector3::new(0.0, -1.0, 0.5),
        };
        let p = Vector3::new(0.3, 0.7, 2.0);

        let composed = a.compose(&b).transform(&p);
        let sequential = a.transform(&b.transform(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-12);
    }

    #[test]
    fn test_projection_matrix_agrees_with_transform() {
        let pose = Pose {
            rotation: UnitQuaternion::from_euler_angles(0.05, 0.1, -0.05),
            translation: Vector3::new(0.2, 0.1, 1.0),
        };
        let p = Vector3::new(0.4, -0.3, 4.0);

        let proj = pose.projection_matrix();
        let homogeneous = nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
        let via_matrix = proj * homogeneous;
        let via_transform = pose.transform(&p);
        assert_relative_eq!(via_matrix, via_transform, epsilon = 1e-12);
    }

    #[test]
    fn test_project_rejects_points_behind_camera() {
        let pose = Pose::identity();
        assert!(pose.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(pose.project(&Vector3::new(0.1, 0.2, 2.0)).is_some());
    }

    #[test]
    fn test_center_is_fixed_point_origin() {
        let pose = Pose {
            rotation: UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        let center = pose.center();
        assert_relative_eq!(pose.transform(&center), Vector3::zeros(), epsilon = 1e-12);
    }
}
