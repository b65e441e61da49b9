//! Essential-matrix estimation for two-view initialization.
//!
//! Works entirely in calibrated (normalized) image coordinates: the
//! epipolar constraint is `x1^T E x0 = 0` with `E = [t]x R`, where
//! `(R, t)` is the world-to-camera transform of the second view and the
//! first view is the world frame. Estimation is the 8-point algorithm
//! inside RANSAC; the returned matrix is projected onto the essential
//! cone (singular values 1, 1, 0), which also fixes the global scale.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::prelude::*;

use crate::geometry::so3::skew;

/// Configuration for essential-matrix RANSAC.
#[derive(Debug, Clone)]
pub struct EssentialRansacConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold on the squared Sampson error (normalized
    /// coordinates). 1e-6 corresponds to roughly half a pixel at a
    /// 500px focal length.
    pub sampson_threshold: f64,
    /// Minimum number of inliers required for a model to be accepted.
    pub min_inliers: usize,
    /// Probability of finding an all-inlier sample.
    pub probability: f64,
}

impl Default for EssentialRansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            sampson_threshold: 1e-6,
            min_inliers: 8,
            probability: 0.99,
        }
    }
}

/// Result of essential-matrix RANSAC.
#[derive(Debug, Clone)]
pub struct EssentialResult {
    /// Estimated essential matrix (unit Frobenius-scale).
    pub essential: Matrix3<f64>,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Number of inliers.
    pub num_inliers: usize,
}

/// Estimate the essential matrix from calibrated correspondences with
/// the 8-point algorithm inside RANSAC.
///
/// `pairs` holds `(x0, x1)` normalized coordinates in the first and
/// second view. Returns `None` when no model reaches
/// `config.min_inliers`.
pub fn estimate_essential_ransac(
    pairs: &[(Vector2<f64>, Vector2<f64>)],
    config: &EssentialRansacConfig,
) -> Option<EssentialResult> {
    let n = pairs.len();
    if n < 8 || n < config.min_inliers {
        return None;
    }

    let mut rng = rand::thread_rng();
    let mut best_result: Option<EssentialResult> = None;
    let mut best_inliers = 0;

    // Adaptive number of iterations based on inlier ratio
    let mut max_iter = config.max_iterations;

    let mut iteration = 0;
    while iteration < max_iter {
        iteration += 1;

        let indices = sample_unique_indices(&mut rng, 8, n);
        let sample: Vec<_> = indices.iter().map(|&i| pairs[i]).collect();

        let essential = match eight_point_essential(&sample) {
            Some(e) => e,
            None => continue,
        };

        let (inliers, _) = find_inliers(pairs, &essential, config.sampson_threshold);

        if inliers.len() > best_inliers {
            best_inliers = inliers.len();
            best_result = Some(EssentialResult {
                essential,
                num_inliers: inliers.len(),
                inliers,
            });

            if best_inliers >= config.min_inliers {
                let inlier_ratio = best_inliers as f64 / n as f64;
                let updated_iter =
                    compute_adaptive_iterations(inlier_ratio, config.probability, 8);
                max_iter = max_iter.min(iteration + updated_iter);
            }
        }
    }

    // Refit on the full inlier set
    if let Some(ref mut result) = best_result {
        if result.num_inliers >= config.min_inliers {
            let inlier_pairs: Vec<_> = result.inliers.iter().map(|&i| pairs[i]).collect();
            if let Some(refined) = eight_point_essential(&inlier_pairs) {
                let (new_inliers, _) = find_inliers(pairs, &refined, config.sampson_threshold);
                if new_inliers.len() >= result.num_inliers {
                    result.essential = refined;
                    result.num_inliers = new_inliers.len();
                    result.inliers = new_inliers;
                }
            }
        }
    }

    best_result.filter(|r| r.num_inliers >= config.min_inliers)
}

/// 8-point linear estimate of the essential matrix.
///
/// Builds the n x 9 constraint matrix, takes the SVD nullspace vector,
/// and projects the reshaped matrix onto the essential cone. Returns
/// `None` for degenerate inputs (fewer than 8 pairs or a failed SVD).
pub fn eight_point_essential(
    pairs: &[(Vector2<f64>, Vector2<f64>)],
) -> Option<Matrix3<f64>> {
    let n = pairs.len();
    if n < 8 {
        return None;
    }

    // One constraint row per correspondence: x1^T E x0 = 0 vectorized
    // over E's rows.
    let mut a = DMatrix::<f64>::zeros(n.max(9), 9);
    for (i, (x0, x1)) in pairs.iter().enumerate() {
        a[(i, 0)] = x1.x * x0.x;
        a[(i, 1)] = x1.x * x0.y;
        a[(i, 2)] = x1.x;
        a[(i, 3)] = x1.y * x0.x;
        a[(i, 4)] = x1.y * x0.y;
        a[(i, 5)] = x1.y;
        a[(i, 6)] = x0.x;
        a[(i, 7)] = x0.y;
        a[(i, 8)] = 1.0;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let e_vec = v_t.row(v_t.nrows() - 1);

    let mut e = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            e[(r, c)] = e_vec[3 * r + c];
        }
    }

    // Project onto the essential cone: singular values (1, 1, 0).
    let svd_e = e.svd(true, true);
    let u = svd_e.u?;
    let v_t = svd_e.v_t?;
    let s = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0));
    Some(u * s * v_t)
}

/// Squared Sampson error of a correspondence under an essential matrix.
///
/// First-order approximation of the squared geometric distance to the
/// epipolar constraint manifold.
pub fn sampson_error_sq(
    essential: &Matrix3<f64>,
    x0: &Vector2<f64>,
    x1: &Vector2<f64>,
) -> f64 {
    let h0 = Vector3::new(x0.x, x0.y, 1.0);
    let h1 = Vector3::new(x1.x, x1.y, 1.0);

    let e_x0 = essential * h0;
    let et_x1 = essential.transpose() * h1;
    let constraint = h1.dot(&e_x0);

    let denom = e_x0.x * e_x0.x + e_x0.y * e_x0.y + et_x1.x * et_x1.x + et_x1.y * et_x1.y;
    if denom < 1e-30 {
        return f64::MAX;
    }

    constraint * constraint / denom
}

/// Decompose an essential matrix into its four (R, t) candidates.
///
/// The physically correct candidate must be selected by a chirality
/// vote (triangulated depths positive in both views); `t` is the unit
/// baseline (scale is unobservable from E).
pub fn decompose_essential(essential: &Matrix3<f64>) -> Option<[(Matrix3<f64>, Vector3<f64>); 4]> {
    let svd = essential.svd(true, true);
    let mut u = svd.u?;
    let mut v_t = svd.v_t?;

    // Keep both factors proper rotations.
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }

    let w = Matrix3::new(
        0.0, -1.0, 0.0,
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
    );

    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    Some([(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

/// Build the essential matrix from a known relative motion, `E = [t]x R`.
pub fn essential_from_pose(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation
}

fn find_inliers(
    pairs: &[(Vector2<f64>, Vector2<f64>)],
    essential: &Matrix3<f64>,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut sum_error = 0.0;

    for (i, (x0, x1)) in pairs.iter().enumerate() {
        let error = sampson_error_sq(essential, x0, x1);
        if error < threshold {
            inliers.push(i);
            sum_error += error;
        }
    }

    let mean = if inliers.is_empty() {
        f64::INFINITY
    } else {
        sum_error / inliers.len() as f64
    };

    (inliers, mean)
}

/// Sample `count` unique random indices in `0..n`.
pub(crate) fn sample_unique_indices(rng: &mut impl Rng, count: usize, n: usize) -> Vec<usize> {
    debug_assert!(count <= n, "cannot sample {count} unique indices from {n}");
    let mut indices = Vec::with_capacity(count);
    while indices.len() < count {
        let candidate = rng.gen_range(0..n);
        if !indices.contains(&candidate) {
            indices.push(candidate);
        }
    }
    indices
}

/// RANSAC iteration count for a target confidence given the observed
/// inlier ratio: `k = log(1 - p) / log(1 - w^n)`.
pub(crate) fn compute_adaptive_iterations(
    inlier_ratio: f64,
    probability: f64,
    sample_size: usize,
) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();

    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}
