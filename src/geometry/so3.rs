//! SO(3) helpers shared by the epipolar and refinement code.

use nalgebra::{Matrix3, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        let cross_direct = v.cross(&u);
        let cross_skew = skew(&v) * u;

        assert_relative_eq!(cross_direct, cross_skew, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }
}
