//! Perspective pose estimation.
//!
//! Two entry points, matching the two phases of incremental
//! reconstruction:
//!
//! - [`PoseEstimator::estimate`] solves PnP from 3D-2D correspondences
//!   against the existing map: DLT projection fit on minimal samples
//!   inside RANSAC, then Gauss-Newton pose-only refinement on the
//!   inliers.
//! - [`PoseEstimator::bootstrap`] initializes from two views when no
//!   landmarks exist yet: essential-matrix RANSAC, chirality vote over
//!   the four decomposition candidates, then batch triangulation. The
//!   first view is the world frame and the recovered baseline has unit
//!   length (monocular scale is unobservable).

use nalgebra::{DMatrix, Matrix2x6, Matrix3, Matrix6, Vector2, Vector3, Vector6};
use rand::prelude::*;
use thiserror::Error;

use crate::geometry::epipolar::{
    compute_adaptive_iterations, decompose_essential, estimate_essential_ransac,
    sample_unique_indices, EssentialRansacConfig,
};
use crate::geometry::so3::skew;
use crate::geometry::{Pose, Triangulator, TriangulatorConfig};

/// Pose estimation failures. All are recoverable: the caller drops the
/// frame and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoseError {
    /// Correspondence count below the configured minimum, a degenerate
    /// solve, or a consensus set that stayed too small.
    #[error("not enough inliers ({found} < {required})")]
    NotEnoughInliers { found: usize, required: usize },
}

/// Configuration for the PnP RANSAC solver.
#[derive(Debug, Clone)]
pub struct PnpConfig {
    /// Minimum number of 3D-2D correspondences (and final inliers).
    pub min_correspondences: usize,
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold on the squared reprojection error in normalized
    /// coordinates.
    pub reproj_threshold_sq: f64,
    /// Gauss-Newton refinement iterations on the inlier set.
    pub refine_iterations: usize,
    /// Probability of finding an all-inlier sample.
    pub probability: f64,
}

impl Default for PnpConfig {
    fn default() -> Self {
        Self {
            min_correspondences: 8,
            max_iterations: 100,
            reproj_threshold_sq: 1e-6,
            refine_iterations: 10,
            probability: 0.99,
        }
    }
}

/// Result of a PnP solve.
#[derive(Debug, Clone)]
pub struct PnpResult {
    /// Estimated world-to-camera pose.
    pub pose: Pose,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Number of inliers.
    pub num_inliers: usize,
}

/// Result of two-view initialization.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    /// Pose of the first view (always the identity).
    pub pose0: Pose,
    /// Pose of the second view, unit-baseline.
    pub pose1: Pose,
    /// Triangulated points, aligned with `valid_matches`.
    pub points: Vec<Vector3<f64>>,
    /// Indices into the input match list that survived RANSAC and the
    /// chirality check.
    pub valid_matches: Vec<usize>,
}

/// Perspective pose solver over calibrated correspondences.
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    pnp: PnpConfig,
    essential: EssentialRansacConfig,
    triangulator: Triangulator,
}

impl Default for PoseEstimator {
    fn default() -> Self {
        Self::new(
            PnpConfig::default(),
            EssentialRansacConfig::default(),
            TriangulatorConfig::default(),
        )
    }
}

impl PoseEstimator {
    pub fn new(
        pnp: PnpConfig,
        essential: EssentialRansacConfig,
        triangulator: TriangulatorConfig,
    ) -> Self {
        Self {
            pnp,
            essential,
            triangulator: Triangulator::new(triangulator),
        }
    }

    /// Solve the camera pose from 3D landmark / 2D keypoint
    /// correspondences (normalized coordinates).
    pub fn estimate(
        &self,
        points: &[Vector3<f64>],
        keypoints: &[Vector2<f64>],
    ) -> Result<PnpResult, PoseError> {
        let n = points.len();
        debug_assert_eq!(n, keypoints.len(), "correspondence arrays must align");
        if n < self.pnp.min_correspondences {
            return Err(PoseError::NotEnoughInliers {
                found: n,
                required: self.pnp.min_correspondences,
            });
        }

        let mut rng = rand::thread_rng();
        let mut best_pose: Option<Pose> = None;
        let mut best_inliers: Vec<usize> = Vec::new();

        let mut max_iter = self.pnp.max_iterations;
        let mut iteration = 0;
        while iteration < max_iter {
            iteration += 1;

            let indices = sample_unique_indices(&mut rng, 6, n);
            let sample_points: Vec<_> = indices.iter().map(|&i| points[i]).collect();
            let sample_kps: Vec<_> = indices.iter().map(|&i| keypoints[i]).collect();

            let pose = match solve_pnp_dlt(&sample_points, &sample_kps) {
                Some(p) => p,
                None => continue,
            };

            let inliers = find_inliers(&pose, points, keypoints, self.pnp.reproj_threshold_sq);
            if inliers.len() > best_inliers.len() {
                best_inliers = inliers;
                best_pose = Some(pose);

                if best_inliers.len() >= self.pnp.min_correspondences {
                    let ratio = best_inliers.len() as f64 / n as f64;
                    let updated = compute_adaptive_iterations(ratio, self.pnp.probability, 6);
                    max_iter = max_iter.min(iteration + updated);
                }
            }
        }

        let mut pose = best_pose.ok_or(PoseError::NotEnoughInliers {
            found: 0,
            required: self.pnp.min_correspondences,
        })?;

        if best_inliers.len() < self.pnp.min_correspondences {
            return Err(PoseError::NotEnoughInliers {
                found: best_inliers.len(),
                required: self.pnp.min_correspondences,
            });
        }

        // Refit on the consensus set, then polish with Gauss-Newton.
        let inlier_points: Vec<_> = best_inliers.iter().map(|&i| points[i]).collect();
        let inlier_kps: Vec<_> = best_inliers.iter().map(|&i| keypoints[i]).collect();
        if let Some(refit) = solve_pnp_dlt(&inlier_points, &inlier_kps) {
            let refit_inliers =
                find_inliers(&refit, points, keypoints, self.pnp.reproj_threshold_sq);
            if refit_inliers.len() >= best_inliers.len() {
                pose = refit;
                best_inliers = refit_inliers;
            }
        }

        let refine_points: Vec<_> = best_inliers.iter().map(|&i| points[i]).collect();
        let refine_kps: Vec<_> = best_inliers.iter().map(|&i| keypoints[i]).collect();
        pose = refine_pose(&pose, &refine_points, &refine_kps, self.pnp.refine_iterations);

        Ok(PnpResult {
            pose,
            num_inliers: best_inliers.len(),
            inliers: best_inliers,
        })
    }

    /// Two-view initialization from matched keypoints.
    ///
    /// `matches` pairs indices into `keypoints0` and `keypoints1`. The
    /// returned points are expressed in the first view's frame at unit
    /// baseline scale.
    pub fn bootstrap(
        &self,
        keypoints0: &[Vector2<f64>],
        keypoints1: &[Vector2<f64>],
        matches: &[(usize, usize)],
    ) -> Result<BootstrapResult, PoseError> {
        let pairs: Vec<_> = matches
            .iter()
            .map(|&(i0, i1)| (keypoints0[i0], keypoints1[i1]))
            .collect();

        let essential = estimate_essential_ransac(&pairs, &self.essential).ok_or(
            PoseError::NotEnoughInliers {
                found: 0,
                required: self.essential.min_inliers,
            },
        )?;

        let candidates =
            decompose_essential(&essential.essential).ok_or(PoseError::NotEnoughInliers {
                found: 0,
                required: self.essential.min_inliers,
            })?;

        // Chirality vote: the correct (R, t) places the triangulated
        // inliers in front of both cameras.
        let pose0 = Pose::identity();
        let inlier_pairs: Vec<_> = essential.inliers.iter().map(|&i| pairs[i]).collect();

        let mut best_candidate: Option<Pose> = None;
        let mut best_votes = 0usize;
        for (rotation, translation) in &candidates {
            let pose1 = Pose::from_rt(*rotation, *translation);
            let votes = inlier_pairs
                .iter()
                .filter(|(kp0, kp1)| {
                    self.triangulator
                        .triangulate_pair(&pose0, &pose1, kp0, kp1)
                        .is_ok()
                })
                .count();
            if votes > best_votes {
                best_votes = votes;
                best_candidate = Some(pose1);
            }
        }

        let pose1 = best_candidate.ok_or(PoseError::NotEnoughInliers {
            found: 0,
            required: self.essential.min_inliers,
        })?;

        // Triangulate the surviving matches; the validity mask drops the
        // pairs that fail the depth check under the winning pose.
        let batch = self
            .triangulator
            .triangulate_batch(&pose0, &pose1, &inlier_pairs);

        let mut points = Vec::new();
        let mut valid_matches = Vec::new();
        for (slot, &match_idx) in essential.inliers.iter().enumerate() {
            if batch.valid[slot] {
                points.push(batch.points[slot]);
                valid_matches.push(match_idx);
            }
        }

        if valid_matches.len() < self.essential.min_inliers {
            return Err(PoseError::NotEnoughInliers {
                found: valid_matches.len(),
                required: self.essential.min_inliers,
            });
        }

        Ok(BootstrapResult {
            pose0,
            pose1,
            points,
            valid_matches,
        })
    }
}

/// Direct linear fit of the calibrated projection `[R | t]` from six or
/// more correspondences, with orthogonal projection of the rotation
/// block back onto SO(3).
fn solve_pnp_dlt(points: &[Vector3<f64>], keypoints: &[Vector2<f64>]) -> Option<Pose> {
    let n = points.len();
    if n < 6 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros((2 * n).max(12), 12);
    for (i, (point, kp)) in points.iter().zip(keypoints.iter()).enumerate() {
        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        let x = [point.x, point.y, point.z, 1.0];

        for j in 0..4 {
            a[(r0, j)] = x[j];
            a[(r0, 8 + j)] = -kp.x * x[j];
            a[(r1, 4 + j)] = x[j];
            a[(r1, 8 + j)] = -kp.y * x[j];
        }
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let p = v_t.row(v_t.nrows() - 1);

    let m = Matrix3::new(
        p[0], p[1], p[2],
        p[4], p[5], p[6],
        p[8], p[9], p[10],
    );
    let b = Vector3::new(p[3], p[7], p[11]);

    // The rotation block of a calibrated projection has determinant
    // lambda^3; a sign-preserving cube root recovers the scale. The
    // global sign ambiguity of the SVD solution cancels here.
    let det = m.determinant();
    if det.abs() < 1e-12 {
        return None;
    }
    let lambda = det.signum() * det.abs().cbrt();

    let m_scaled = m / lambda;
    let translation = b / lambda;

    // Nearest rotation (orthogonal Procrustes).
    let svd_m = m_scaled.svd(true, true);
    let u = svd_m.u?;
    let v_t = svd_m.v_t?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_flipped = u;
        for i in 0..3 {
            u_flipped[(i, 2)] = -u_flipped[(i, 2)];
        }
        rotation = u_flipped * v_t;
    }

    Some(Pose::from_rt(rotation, translation))
}

/// Pose-only Gauss-Newton refinement of the reprojection error.
///
/// The update is a left multiplicative perturbation `exp([w]x)` on the
/// rotation plus a translation increment; a step that increases the
/// total error is rolled back and refinement stops.
fn refine_pose(
    initial: &Pose,
    points: &[Vector3<f64>],
    keypoints: &[Vector2<f64>],
    iterations: usize,
) -> Pose {
    let mut pose = *initial;
    let mut last_error = reprojection_error_sum(&pose, points, keypoints);

    for _ in 0..iterations {
        let mut h = Matrix6::<f64>::zeros();
        let mut g = Vector6::<f64>::zeros();

        for (point, kp) in points.iter().zip(keypoints.iter()) {
            let cam = pose.transform(point);
            if cam.z <= 1e-12 {
                continue;
            }

            let inv_z = 1.0 / cam.z;
            let projected = Vector2::new(cam.x * inv_z, cam.y * inv_z);
            let residual = projected - kp;

            // d(projection)/d(camera point)
            let dproj = nalgebra::Matrix2x3::new(
                inv_z, 0.0, -cam.x * inv_z * inv_z,
                0.0, inv_z, -cam.y * inv_z * inv_z,
            );

            // Left perturbation: cam' = exp([w]x) cam + dt.
            let mut jac = Matrix2x6::<f64>::zeros();
            let dcam_dw = -skew(&cam);
            jac.fixed_view_mut::<2, 3>(0, 0)
                .copy_from(&(dproj * dcam_dw));
            jac.fixed_view_mut::<2, 3>(0, 3).copy_from(&dproj);

            h += jac.transpose() * jac;
            g += jac.transpose() * residual;
        }

        let delta = match h.cholesky() {
            Some(chol) => chol.solve(&(-g)),
            None => break,
        };

        if delta.norm() < 1e-14 {
            break;
        }

        let w = Vector3::new(delta[0], delta[1], delta[2]);
        let dt = Vector3::new(delta[3], delta[4], delta[5]);
        let dq = nalgebra::UnitQuaternion::from_scaled_axis(w);
        let candidate = Pose {
            rotation: dq * pose.rotation,
            translation: dq * pose.translation + dt,
        };

        let error = reprojection_error_sum(&candidate, points, keypoints);
        if error >= last_error {
            break;
        }
        pose = candidate;
        last_error = error;
    }

    pose
}

fn reprojection_error_sum(
    pose: &Pose,
    points: &[Vector3<f64>],
    keypoints: &[Vector2<f64>],
) -> f64 {
    points
        .iter()
        .zip(keypoints.iter())
        .map(|(point, kp)| match pose.project(point) {
            Some(projected) => (projected - kp).norm_squared(),
            None => 1e12,
        })
        .sum()
}

fn find_inliers(
    pose: &Pose,
    points: &[Vector3<f64>],
    keypoints: &[Vector2<f64>],
    threshold_sq: f64,
) -> Vec<usize> {
    points
        .iter()
        .zip(keypoints.iter())
        .enumerate()
        .filter_map(|(i, (point, kp))| {
            let projected = pose.project(point)?;
            if (projected - kp).norm_squared() < threshold_sq {
                Some(i)
            } else {
                None
            }
        })
        .collect()
}
