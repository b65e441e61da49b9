//! Two-view triangulation of calibrated correspondences.
//!
//! Given two world-to-camera poses and a pair of normalized image
//! observations, recovers the 3D point as the linear least-squares
//! intersection of the back-projected rays (DLT). Candidates whose depth
//! is non-positive or non-finite in either camera are rejected; near-zero
//! baselines make the system ill-conditioned and are not corrected here.

use nalgebra::{Matrix4, Vector2, Vector3};
use thiserror::Error;

use crate::geometry::Pose;

/// Triangulation failures. All of them mean "no landmark for this
/// correspondence"; none is fatal to the frame being processed.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TriangulationError {
    /// Chirality failure: the candidate point does not lie at a finite,
    /// positive depth in front of both cameras.
    #[error("invalid depth (z0 = {depth0:.3e}, z1 = {depth1:.3e})")]
    InvalidDepth { depth0: f64, depth1: f64 },
}

/// Tuning knobs for [`Triangulator`].
#[derive(Debug, Clone, Copy)]
pub struct TriangulatorConfig {
    /// Minimum accepted depth in either camera frame.
    pub min_depth: f64,
    /// Homogeneous-coordinate magnitude below which the DLT solution is
    /// treated as a point at infinity.
    pub homogeneous_epsilon: f64,
}

impl Default for TriangulatorConfig {
    fn default() -> Self {
        Self {
            min_depth: 1e-9,
            homogeneous_epsilon: 1e-10,
        }
    }
}

/// Result of a batch triangulation: one candidate per input pair and a
/// validity mask aligned with the input order. Invalid slots hold zeros
/// and must not be bound downstream.
#[derive(Debug, Clone)]
pub struct BatchTriangulation {
    pub points: Vec<Vector3<f64>>,
    pub valid: Vec<bool>,
}

impl BatchTriangulation {
    pub fn num_valid(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}

/// DLT triangulator over calibrated two-view correspondences.
#[derive(Debug, Clone, Copy, Default)]
pub struct Triangulator {
    config: TriangulatorConfig,
}

impl Triangulator {
    pub fn new(config: TriangulatorConfig) -> Self {
        Self { config }
    }

    /// Triangulate one correspondence seen from two posed cameras.
    ///
    /// `kp0` and `kp1` are normalized image coordinates in the cameras of
    /// `pose0` and `pose1` respectively (both world-to-camera).
    pub fn triangulate_pair(
        &self,
        pose0: &Pose,
        pose1: &Pose,
        kp0: &Vector2<f64>,
        kp1: &Vector2<f64>,
    ) -> Result<Vector3<f64>, TriangulationError> {
        let p0 = pose0.projection_matrix();
        let p1 = pose1.projection_matrix();

        // DLT system A * X = 0; each view contributes two rows
        // (x * P[2] - P[0] and y * P[2] - P[1]).
        let mut a = Matrix4::<f64>::zeros();
        for j in 0..4 {
            a[(0, j)] = kp0.x * p0[(2, j)] - p0[(0, j)];
            a[(1, j)] = kp0.y * p0[(2, j)] - p0[(1, j)];
            a[(2, j)] = kp1.x * p1[(2, j)] - p1[(0, j)];
            a[(3, j)] = kp1.y * p1[(2, j)] - p1[(1, j)];
        }

        // The solution is the right singular vector of the smallest
        // singular value.
        let svd = a.svd(true, true);
        let point = match svd.v_t {
            Some(v_t) => {
                let v = v_t.transpose();
                let h = v.column(3);
                if h[3].abs() < self.config.homogeneous_epsilon {
                    // Point at infinity; report as infinite depth.
                    return Err(TriangulationError::InvalidDepth {
                        depth0: f64::INFINITY,
                        depth1: f64::INFINITY,
                    });
                }
                Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3])
            }
            None => {
                return Err(TriangulationError::InvalidDepth {
                    depth0: f64::NAN,
                    depth1: f64::NAN,
                })
            }
        };

        let depth0 = pose0.depth_of(&point);
        let depth1 = pose1.depth_of(&point);
        let finite = depth0.is_finite() && depth1.is_finite();
        if !finite || depth0 < self.config.min_depth || depth1 < self.config.min_depth {
            return Err(TriangulationError::InvalidDepth { depth0, depth1 });
        }

        Ok(point)
    }

    /// Triangulate a batch of correspondences between the same two poses.
    ///
    /// The output arrays are aligned with the input order; entries whose
    /// mask is `false` failed the chirality check and hold a zero point.
    pub fn triangulate_batch(
        &self,
        pose0: &Pose,
        pose1: &Pose,
        pairs: &[(Vector2<f64>, Vector2<f64>)],
    ) -> BatchTriangulation {
        let mut points = Vec::with_capacity(pairs.len());
        let mut valid = Vec::with_capacity(pairs.len());

        for (kp0, kp1) in pairs {
            match self.triangulate_pair(pose0, pose1, kp0, kp1) {
                Ok(point) => {
                    points.push(point);
                    valid.push(true);
                }
                Err(_) => {
                    points.push(Vector3::zeros());
                    valid.push(false);
                }
            }
        }

        BatchTriangulation { points, valid }
    }
}
