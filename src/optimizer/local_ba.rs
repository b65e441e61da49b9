//! Windowed bundle adjustment.
//!
//! Optimizes viewpoint poses and landmark positions to minimize
//! reprojection error over the active window. Gauss-Newton with a
//! Schur complement on the landmark block: landmarks appear only in
//! block-diagonal form, so the reduced system is dense in poses alone.
//!
//! The first pose of the problem is the gauge anchor and stays fixed;
//! every other pose and every landmark is free. The solver never
//! mutates its inputs. A step that increases the total robust cost is
//! rolled back, so the returned estimates are never worse than the
//! initial ones.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, Vector2, Vector3};
use tracing::debug;

use crate::geometry::so3::skew;
use crate::geometry::Pose;
use crate::map::{LandmarkId, ViewpointId};

/// One reprojection constraint: a landmark seen at a calibrated
/// keypoint from a viewpoint.
#[derive(Debug, Clone, Copy)]
pub struct BaObservation {
    pub viewpoint: ViewpointId,
    pub landmark: LandmarkId,
    pub keypoint: Vector2<f64>,
}

/// Refined estimates plus iteration statistics.
#[derive(Debug, Clone)]
pub struct BaSolution {
    pub poses: Vec<(ViewpointId, Pose)>,
    pub points: Vec<(LandmarkId, Vector3<f64>)>,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Initial total robust reprojection cost.
    pub initial_error: f64,
    /// Final total robust reprojection cost.
    pub final_error: f64,
    /// Number of observations (edges) used.
    pub num_observations: usize,
}

/// Batched refinement of poses and landmark positions.
///
/// Implementations must be pure with respect to their inputs and must
/// tolerate repeated calls with overlapping viewpoint and landmark
/// sets. Returning `None` means the problem was too small or the solve
/// degenerate; the caller keeps its current estimates.
pub trait BundleAdjuster {
    fn optimize(
        &self,
        observations: &[BaObservation],
        initial_poses: &[(ViewpointId, Pose)],
        initial_points: &[(LandmarkId, Vector3<f64>)],
    ) -> Option<BaSolution>;
}

/// Configuration for the Gauss-Newton adjuster.
#[derive(Debug, Clone)]
pub struct LocalBaConfig {
    /// Maximum number of Gauss-Newton iterations.
    pub max_iterations: usize,
    /// Convergence threshold (relative change in error).
    pub convergence_threshold: f64,
    /// Huber kernel threshold on the squared calibrated reprojection
    /// error.
    pub huber_threshold: f64,
    /// Minimum number of usable observations to attempt a solve.
    pub min_observations: usize,
    /// Diagonal damping added to both Hessian blocks.
    pub damping: f64,
}

impl Default for LocalBaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            convergence_threshold: 1e-6,
            huber_threshold: 1e-5,
            min_observations: 6,
            damping: 1e-6,
        }
    }
}

/// Gauss-Newton bundle adjuster over calibrated observations.
#[derive(Debug, Clone, Default)]
pub struct GaussNewtonAdjuster {
    config: LocalBaConfig,
}

impl GaussNewtonAdjuster {
    pub fn new(config: LocalBaConfig) -> Self {
        Self { config }
    }
}

impl BundleAdjuster for GaussNewtonAdjuster {
    fn optimize(
        &self,
        observations: &[BaObservation],
        initial_poses: &[(ViewpointId, Pose)],
        initial_points: &[(LandmarkId, Vector3<f64>)],
    ) -> Option<BaSolution> {
        if initial_poses.is_empty() || initial_points.is_empty() {
            return None;
        }

        // The anchor (first pose) is fixed; the rest are variables.
        let anchor_id = initial_poses[0].0;
        let free_ids: Vec<ViewpointId> = initial_poses[1..].iter().map(|&(id, _)| id).collect();
        let pose_index: HashMap<ViewpointId, usize> = free_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        let point_index: HashMap<LandmarkId, usize> = initial_points
            .iter()
            .enumerate()
            .map(|(i, &(id, _))| (id, i))
            .collect();

        // Observations referencing ids outside the problem are dropped.
        let edges: Vec<&BaObservation> = observations
            .iter()
            .filter(|obs| {
                point_index.contains_key(&obs.landmark)
                    && (obs.viewpoint == anchor_id || pose_index.contains_key(&obs.viewpoint))
            })
            .collect();
        if edges.len() < self.config.min_observations {
            return None;
        }

        let anchor_pose = initial_poses[0].1;
        let mut poses: Vec<Pose> = initial_poses[1..].iter().map(|&(_, p)| p).collect();
        let mut points: Vec<Vector3<f64>> = initial_points.iter().map(|&(_, p)| p).collect();

        let num_pose_params = poses.len() * 6;
        let num_point_params = points.len() * 3;

        let pose_of = |poses: &[Pose], viewpoint: ViewpointId| -> Pose {
            match pose_index.get(&viewpoint) {
                Some(&idx) => poses[idx],
                None => anchor_pose,
            }
        };

        let total_error = |poses: &[Pose], points: &[Vector3<f64>]| -> f64 {
            edges
                .iter()
                .map(|obs| {
                    let pose = pose_of(poses, obs.viewpoint);
                    let residual = reprojection_residual(
                        &pose,
                        &points[point_index[&obs.landmark]],
                        &obs.keypoint,
                    );
                    huber_cost(residual.norm_squared(), self.config.huber_threshold)
                })
                .sum()
        };

        let initial_error = total_error(&poses, &points);
        let mut current_error = initial_error;
        let mut iterations = 0;

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;

            let mut h_pp = DMatrix::<f64>::zeros(num_pose_params, num_pose_params);
            let mut b_p = DVector::<f64>::zeros(num_pose_params);
            let mut h_ll = DMatrix::<f64>::zeros(num_point_params, num_point_params);
            let mut b_l = DVector::<f64>::zeros(num_point_params);
            let mut h_pl = DMatrix::<f64>::zeros(num_pose_params, num_point_params);

            for obs in &edges {
                let point_idx = point_index[&obs.landmark];
                let pose = pose_of(&poses, obs.viewpoint);
                let point = points[point_idx];

                let residual = reprojection_residual(&pose, &point, &obs.keypoint);
                let weight = huber_weight(residual.norm_squared(), self.config.huber_threshold);
                let (j_pose, j_point) = reprojection_jacobians(&pose, &point);

                let j_point_w = j_point * weight;
                let h_ll_contrib = j_point.transpose() * j_point_w;
                for i in 0..3 {
                    for j in 0..3 {
                        h_ll[(point_idx * 3 + i, point_idx * 3 + j)] += h_ll_contrib[(i, j)];
                    }
                }
                let b_l_contrib = -j_point.transpose() * (residual * weight);
                for i in 0..3 {
                    b_l[point_idx * 3 + i] += b_l_contrib[i];
                }

                if let Some(&pose_idx) = pose_index.get(&obs.viewpoint) {
                    let j_pose_w = j_pose * weight;
                    let h_pp_contrib = j_pose.transpose() * j_pose_w;
                    for i in 0..6 {
                        for j in 0..6 {
                            h_pp[(pose_idx * 6 + i, pose_idx * 6 + j)] += h_pp_contrib[(i, j)];
                        }
                    }
                    let b_p_contrib = -j_pose.transpose() * (residual * weight);
                    for i in 0..6 {
                        b_p[pose_idx * 6 + i] += b_p_contrib[i];
                    }
                    let h_pl_contrib = j_pose.transpose() * j_point_w;
                    for i in 0..6 {
                        for j in 0..3 {
                            h_pl[(pose_idx * 6 + i, point_idx * 3 + j)] += h_pl_contrib[(i, j)];
                        }
                    }
                }
            }

            for i in 0..num_pose_params {
                h_pp[(i, i)] += self.config.damping;
            }
            for i in 0..num_point_params {
                h_ll[(i, i)] += self.config.damping;
            }

            let delta_p = solve_schur_complement(&h_pp, &b_p, &h_ll, &b_l, &h_pl)?;

            let poses_backup = poses.clone();
            let points_backup = points.clone();

            for (i, pose) in poses.iter_mut().enumerate() {
                let w = Vector3::new(delta_p[i * 6], delta_p[i * 6 + 1], delta_p[i * 6 + 2]);
                let t = Vector3::new(delta_p[i * 6 + 3], delta_p[i * 6 + 4], delta_p[i * 6 + 5]);
                *pose = apply_pose_update_left(pose, &w, &t);
            }

            // Back-substitution: delta_l = H_ll^-1 (b_l - H_pl^T delta_p)
            for (i, point) in points.iter_mut().enumerate() {
                let h_ll_block = h_ll.fixed_view::<3, 3>(i * 3, i * 3);
                let mut rhs = Vector3::new(b_l[i * 3], b_l[i * 3 + 1], b_l[i * 3 + 2]);
                for j in 0..num_pose_params {
                    for k in 0..3 {
                        rhs[k] -= h_pl[(j, i * 3 + k)] * delta_p[j];
                    }
                }
                if let Some(h_ll_inv) = h_ll_block.try_inverse() {
                    *point += h_ll_inv * rhs;
                }
            }

            let new_error = total_error(&poses, &points);

            // Step control: reject the update if the error increased.
            if new_error > current_error * 1.001 {
                poses = poses_backup;
                points = points_backup;
                break;
            }

            let relative_change = (current_error - new_error).abs() / current_error.max(1e-12);
            current_error = new_error;
            if relative_change < self.config.convergence_threshold {
                break;
            }
        }

        debug!(
            "[LocalBA] {} poses, {} points, {} edges: error {:.3e} -> {:.3e} in {} iterations",
            initial_poses.len(),
            points.len(),
            edges.len(),
            initial_error,
            current_error,
            iterations
        );

        let mut refined_poses = Vec::with_capacity(initial_poses.len());
        refined_poses.push((anchor_id, anchor_pose));
        for (i, &id) in free_ids.iter().enumerate() {
            refined_poses.push((id, poses[i]));
        }
        let refined_points = initial_points
            .iter()
            .enumerate()
            .map(|(i, &(id, _))| (id, points[i]))
            .collect();

        Some(BaSolution {
            poses: refined_poses,
            points: refined_points,
            iterations,
            initial_error,
            final_error: current_error,
            num_observations: edges.len(),
        })
    }
}

/// Residual of one observation: projected minus observed, in
/// calibrated coordinates. Points at or behind the camera plane get a
/// large constant residual so a step that pushes points there is
/// rejected by the error check.
fn reprojection_residual(
    pose: &Pose,
    point_world: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Vector2<f64> {
    let cam = pose.transform(point_world);
    if cam.z <= 1e-9 {
        return Vector2::new(1e3, 1e3);
    }
    Vector2::new(cam.x / cam.z - observed.x, cam.y / cam.z - observed.y)
}

/// Jacobians of the residual with respect to a left pose perturbation
/// `[rot, trans]` and the world point.
fn reprojection_jacobians(
    pose: &Pose,
    point_world: &Vector3<f64>,
) -> (Matrix2x6<f64>, Matrix2x3<f64>) {
    let cam = pose.transform(point_world);
    if cam.z.abs() < 1e-9 {
        return (Matrix2x6::zeros(), Matrix2x3::zeros());
    }

    let inv_z = 1.0 / cam.z;
    let inv_z2 = inv_z * inv_z;
    let dproj = Matrix2x3::new(
        inv_z, 0.0, -cam.x * inv_z2,
        0.0, inv_z, -cam.y * inv_z2,
    );

    // Left perturbation: cam' = exp([w]x) cam + dt.
    let mut j_pose = Matrix2x6::zeros();
    j_pose
        .fixed_view_mut::<2, 3>(0, 0)
        .copy_from(&(dproj * (-skew(&cam))));
    j_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&dproj);

    // d(cam)/d(world) = R.
    let j_point = dproj * pose.rotation_matrix();

    (j_pose, j_point)
}

/// Solve the reduced pose system `S delta_p = b_s` where
/// `S = H_pp - H_pl H_ll^-1 H_pl^T`. H_ll is block diagonal (3x3 per
/// landmark), so its inverse is taken block by block.
fn solve_schur_complement(
    h_pp: &DMatrix<f64>,
    b_p: &DVector<f64>,
    h_ll: &DMatrix<f64>,
    b_l: &DVector<f64>,
    h_pl: &DMatrix<f64>,
) -> Option<DVector<f64>> {
    let num_pose_params = h_pp.nrows();
    if num_pose_params == 0 {
        return Some(DVector::zeros(0));
    }

    let num_points = h_ll.nrows() / 3;
    let mut h_ll_inv_h_pl_t = DMatrix::<f64>::zeros(h_ll.nrows(), num_pose_params);
    let mut h_ll_inv_b_l = DVector::<f64>::zeros(h_ll.nrows());

    for i in 0..num_points {
        let block = h_ll.fixed_view::<3, 3>(i * 3, i * 3);
        let block_inv = block.try_inverse()?;

        for j in 0..num_pose_params {
            let h_pl_col = Vector3::new(
                h_pl[(j, i * 3)],
                h_pl[(j, i * 3 + 1)],
                h_pl[(j, i * 3 + 2)],
            );
            let result = block_inv * h_pl_col;
            h_ll_inv_h_pl_t[(i * 3, j)] = result[0];
            h_ll_inv_h_pl_t[(i * 3 + 1, j)] = result[1];
            h_ll_inv_h_pl_t[(i * 3 + 2, j)] = result[2];
        }

        let b_l_block = Vector3::new(b_l[i * 3], b_l[i * 3 + 1], b_l[i * 3 + 2]);
        let result = block_inv * b_l_block;
        h_ll_inv_b_l[i * 3] = result[0];
        h_ll_inv_b_l[i * 3 + 1] = result[1];
        h_ll_inv_b_l[i * 3 + 2] = result[2];
    }

    let schur = h_pp - h_pl * &h_ll_inv_h_pl_t;
    let b_schur = b_p - h_pl * &h_ll_inv_b_l;

    schur.lu().solve(&b_schur)
}

/// Apply a pose update via the exponential map, left multiplication:
/// `T_new = exp([w, t]) * T_old`.
fn apply_pose_update_left(
    pose: &Pose,
    delta_rot: &Vector3<f64>,
    delta_trans: &Vector3<f64>,
) -> Pose {
    let dq = nalgebra::UnitQuaternion::from_scaled_axis(*delta_rot);
    Pose {
        rotation: dq * pose.rotation,
        translation: dq * pose.translation + delta_trans,
    }
}

/// Huber robust cost on the squared residual norm.
fn huber_cost(chi2: f64, threshold: f64) -> f64 {
    if chi2 <= threshold {
        0.5 * chi2
    } else {
        let e = chi2.sqrt();
        let th = threshold.sqrt();
        th * (e - 0.5 * th)
    }
}

/// Huber weight for iteratively reweighted least squares.
fn huber_weight(chi2: f64, threshold: f64) -> f64 {
    if chi2 <= threshold {
        1.0
    } else {
        (threshold / chi2).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::TrackGraph;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn grid_points() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for ix in 0..4 {
            for iy in 0..3 {
                for iz in 0..2 {
                    points.push(Vector3::new(
                        -0.9 + 0.6 * ix as f64,
                        -0.5 + 0.5 * iy as f64,
                        4.0 + 1.2 * iz as f64,
                    ));
                }
            }
        }
        points
    }

    fn window_poses() -> Vec<Pose> {
        vec![
            Pose::identity(),
            Pose {
                rotation: UnitQuaternion::from_euler_angles(0.01, -0.03, 0.02),
                translation: Vector3::new(-0.4, 0.05, 0.1),
            },
            Pose {
                rotation: UnitQuaternion::from_euler_angles(0.02, -0.06, 0.03),
                translation: Vector3::new(-0.8, 0.1, 0.15),
            },
        ]
    }

    struct Problem {
        observations: Vec<BaObservation>,
        poses: Vec<(ViewpointId, Pose)>,
        points: Vec<(LandmarkId, Vector3<f64>)>,
    }

    /// Exact projections of a ground-truth scene. Landmark ids come
    /// from a throwaway arena so the handles are realistic.
    fn noiseless_problem() -> Problem {
        let truth_points = grid_points();
        let truth_poses = window_poses();

        let mut graph = TrackGraph::new();
        let ids: Vec<LandmarkId> = truth_points
            .iter()
            .map(|p| graph.create_landmark(*p, ViewpointId::new(0)))
            .collect();

        let mut observations = Vec::new();
        let mut poses = Vec::new();
        for (vp, pose) in truth_poses.iter().enumerate() {
            let viewpoint = ViewpointId::new(vp as u64);
            poses.push((viewpoint, *pose));
            for (point, &landmark) in truth_points.iter().zip(ids.iter()) {
                observations.push(BaObservation {
                    viewpoint,
                    landmark,
                    keypoint: pose.project(point).unwrap(),
                });
            }
        }

        let points = ids
            .iter()
            .zip(truth_points.iter())
            .map(|(&id, &p)| (id, p))
            .collect();
        Problem {
            observations,
            poses,
            points,
        }
    }

    #[test]
    fn test_noiseless_problem_is_fixed_point() {
        let problem = noiseless_problem();
        let adjuster = GaussNewtonAdjuster::default();

        let solution = adjuster
            .optimize(&problem.observations, &problem.poses, &problem.points)
            .unwrap();

        assert!(solution.final_error < 1e-18);
        for ((_, refined), (_, initial)) in solution.poses.iter().zip(problem.poses.iter()) {
            assert_relative_eq!(refined.translation, initial.translation, epsilon = 1e-9);
            assert!(refined.rotation.angle_to(&initial.rotation) < 1e-9);
        }
        for ((_, refined), (_, initial)) in solution.points.iter().zip(problem.points.iter()) {
            assert_relative_eq!(*refined, *initial, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_perturbed_points_reconverge() {
        let mut problem = noiseless_problem();
        for (i, (_, point)) in problem.points.iter_mut().enumerate() {
            // Deterministic perturbation, different per point.
            let s = (i as f64 * 0.7).sin();
            *point += Vector3::new(1e-3 * s, -8e-4 * s, 1.2e-3 * s.cos());
        }

        let adjuster = GaussNewtonAdjuster::default();
        let solution = adjuster
            .optimize(&problem.observations, &problem.poses, &problem.points)
            .unwrap();

        assert!(solution.final_error < 1e-16);
        assert!(solution.final_error < solution.initial_error);
        // The anchor never moves.
        assert_eq!(solution.poses[0].1, problem.poses[0].1);
    }

    #[test]
    fn test_too_few_observations_is_rejected() {
        let problem = noiseless_problem();
        let adjuster = GaussNewtonAdjuster::default();

        let solution =
            adjuster.optimize(&problem.observations[..3], &problem.poses, &problem.points);
        assert!(solution.is_none());
    }

    #[test]
    fn test_unknown_ids_are_dropped() {
        let problem = noiseless_problem();
        let adjuster = GaussNewtonAdjuster::default();

        let mut observations = problem.observations.clone();
        let stray = observations[0];
        observations.push(BaObservation {
            viewpoint: ViewpointId::new(99),
            ..stray
        });

        let solution = adjuster
            .optimize(&observations, &problem.poses, &problem.points)
            .unwrap();
        assert_eq!(solution.num_observations, problem.observations.len());
    }

    #[test]
    fn test_jacobians_match_finite_differences() {
        let pose = window_poses()[1];
        let point = Vector3::new(0.3, -0.2, 4.5);
        let observed = Vector2::new(0.11, -0.04);

        let (j_pose, j_point) = reprojection_jacobians(&pose, &point);
        let eps = 1e-7;

        for col in 0..6 {
            let mut delta = [0.0; 6];
            delta[col] = eps;
            let w = Vector3::new(delta[0], delta[1], delta[2]);
            let t = Vector3::new(delta[3], delta[4], delta[5]);
            let plus =
                reprojection_residual(&apply_pose_update_left(&pose, &w, &t), &point, &observed);
            let minus =
                reprojection_residual(&apply_pose_update_left(&pose, &-w, &-t), &point, &observed);
            let numeric = (plus - minus) / (2.0 * eps);
            assert_relative_eq!(numeric[0], j_pose[(0, col)], epsilon = 1e-5);
            assert_relative_eq!(numeric[1], j_pose[(1, col)], epsilon = 1e-5);
        }

        for col in 0..3 {
            let mut offset = Vector3::zeros();
            offset[col] = eps;
            let plus = reprojection_residual(&pose, &(point + offset), &observed);
            let minus = reprojection_residual(&pose, &(point - offset), &observed);
            let numeric = (plus - minus) / (2.0 * eps);
            assert_relative_eq!(numeric[0], j_point[(0, col)], epsilon = 1e-5);
            assert_relative_eq!(numeric[1], j_point[(1, col)], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_huber_transition_is_continuous() {
        let threshold = 1e-5;
        let below = huber_cost(threshold * 0.999999, threshold);
        let above = huber_cost(threshold * 1.000001, threshold);
        assert_relative_eq!(below, above, epsilon = 1e-10);
        assert_eq!(huber_weight(threshold * 0.5, threshold), 1.0);
        assert!(huber_weight(threshold * 4.0, threshold) < 1.0);
    }
}
