//! Camera model: mapping raw pixel keypoints to calibrated rays.

use nalgebra::Vector2;

/// Fixed-point iterations used to invert the distortion map.
const UNDISTORT_ITERATIONS: usize = 8;

/// Calibrated-ray conversion for raw keypoints.
///
/// Implementations are pure: the same input always yields the same
/// output and no state is touched.
pub trait CameraModel {
    /// Map raw pixel keypoints into calibrated (unit-focal) image
    /// coordinates.
    fn undistort(&self, raw: &[Vector2<f64>]) -> Vec<Vector2<f64>>;
}

/// Pinhole camera with Brown-Conrady radial-tangential distortion
/// (k1, k2, p1, p2).
#[derive(Debug, Clone, Copy)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
}

impl PinholeCamera {
    /// Distortion-free pinhole model.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self::with_distortion(fx, fy, cx, cy, 0.0, 0.0, 0.0, 0.0)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_distortion(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
    ) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1,
            k2,
            p1,
            p2,
        }
    }

    /// Forward map: calibrated coordinates to distorted pixel
    /// coordinates. Used to synthesize observations in tests and
    /// drivers.
    pub fn project(&self, normalized: &Vector2<f64>) -> Vector2<f64> {
        let distorted = self.distort(normalized);
        Vector2::new(
            self.fx * distorted.x + self.cx,
            self.fy * distorted.y + self.cy,
        )
    }

    fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        Vector2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Inverse map for one pixel: fixed-point iteration on the
    /// distortion model, starting from the distorted coordinates.
    fn undistort_point(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let xd = (pixel.x - self.cx) / self.fx;
        let yd = (pixel.y - self.cy) / self.fy;

        let mut x = xd;
        let mut y = yd;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Vector2::new(x, y)
    }
}

impl CameraModel for PinholeCamera {
    fn undistort(&self, raw: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
        raw.iter().map(|p| self.undistort_point(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_undistort_without_distortion_is_normalization() {
        let camera = PinholeCamera::new(500.0, 480.0, 320.0, 240.0);

        let calibrated = camera.undistort(&[Vector2::new(420.0, 288.0)]);
        assert_relative_eq!(calibrated[0].x, 0.2, epsilon = 1e-12);
        assert_relative_eq!(calibrated[0].y, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_project_undistort_roundtrip() {
        let camera =
            PinholeCamera::with_distortion(500.0, 500.0, 320.0, 240.0, -0.2, 0.05, 0.001, -0.001);

        let normalized = Vector2::new(0.23, -0.17);
        let pixel = camera.project(&normalized);
        let recovered = camera.undistort(&[pixel]);

        assert_relative_eq!(recovered[0], normalized, epsilon = 1e-9);
    }

    #[test]
    fn test_unit_camera_is_passthrough() {
        let camera = PinholeCamera::new(1.0, 1.0, 0.0, 0.0);

        let raw = vec![Vector2::new(0.4, -0.3), Vector2::new(-0.1, 0.2)];
        let calibrated = camera.undistort(&raw);
        assert_eq!(calibrated, raw);
    }
}
