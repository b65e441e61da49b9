//! Incremental reconstruction pipeline.
//!
//! Drives the full per-frame cycle: feature extraction and
//! undistortion, matching against the active window, track resolution,
//! pose estimation, landmark creation, window eviction, and windowed
//! bundle adjustment.
//!
//! Frame admission is atomic. Every fallible step runs before the
//! first mutation, so a rejected frame leaves the map, the window, and
//! the pose log exactly as they were. Commits only perform operations
//! that cannot fail; an individual bind or triangulation that turns
//! out to be unusable is skipped and counted, never escalated.

use std::collections::{BTreeMap, HashMap};

use nalgebra::Vector3;
use tracing::{debug, info};

use crate::frontend::{CameraModel, FeatureExtractor, FeatureSet, Matcher};
use crate::geometry::{Pose, PoseEstimator, Triangulator};
use crate::map::{KeyframeWindow, LandmarkId, ObservationKey, TrackGraph, ViewpointId};
use crate::optimizer::{BaObservation, BundleAdjuster};
use crate::pipeline::{FrameError, FrameSummary, PipelineConfig, PipelineState};

/// Incremental structure-from-motion over a monocular frame stream.
///
/// Generic over its collaborators: the feature extractor, the camera
/// model, the descriptor matcher, and the bundle adjuster.
pub struct ReconstructionPipeline<E, C, M, B> {
    extractor: E,
    camera: C,
    matcher: M,
    adjuster: B,

    estimator: PoseEstimator,
    triangulator: Triangulator,
    config: PipelineConfig,

    state: PipelineState,
    window: KeyframeWindow,
    tracks: TrackGraph,

    /// Pose log for every viewpoint ever admitted, eviction included.
    poses: BTreeMap<ViewpointId, Pose>,
    /// Calibrated features, retained for active viewpoints only.
    features: HashMap<ViewpointId, FeatureSet>,
}

impl<E, C, M, B> ReconstructionPipeline<E, C, M, B>
where
    E: FeatureExtractor,
    C: CameraModel,
    M: Matcher,
    B: BundleAdjuster,
{
    pub fn new(extractor: E, camera: C, matcher: M, adjuster: B, config: PipelineConfig) -> Self {
        let estimator = PoseEstimator::new(
            config.pnp.clone(),
            config.essential.clone(),
            config.triangulator,
        );
        Self {
            extractor,
            camera,
            matcher,
            adjuster,
            estimator,
            triangulator: Triangulator::new(config.triangulator),
            config,
            state: PipelineState::Empty,
            window: KeyframeWindow::new(),
            tracks: TrackGraph::new(),
            poses: BTreeMap::new(),
            features: HashMap::new(),
        }
    }

    /// Process one frame. On success the frame becomes a new active
    /// viewpoint; on failure nothing changes.
    pub fn add(&mut self, image: &E::Image) -> Result<FrameSummary, FrameError> {
        let raw = self.extractor.extract(image);
        if raw.len() < self.config.min_keypoints {
            return Err(FrameError::InsufficientKeypoints {
                found: raw.len(),
                required: self.config.min_keypoints,
            });
        }
        let keypoints = self.camera.undistort(&raw.keypoints);
        let features = FeatureSet::new(keypoints, raw.descriptors);

        match self.state {
            PipelineState::Empty => Ok(self.admit_reference(features)),
            PipelineState::OneKeyframe => self.bootstrap_frame(features),
            PipelineState::Bootstrapped | PipelineState::Tracking => self.track_frame(features),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Active viewpoints in insertion order.
    pub fn active_viewpoints(&self) -> &[ViewpointId] {
        self.window.active()
    }

    pub fn tracks(&self) -> &TrackGraph {
        &self.tracks
    }

    pub fn num_landmarks(&self) -> usize {
        self.tracks.num_landmarks()
    }

    /// Current landmark positions, sorted by handle.
    pub fn export_points(&self) -> Vec<(LandmarkId, Vector3<f64>)> {
        let mut points: Vec<_> = self
            .tracks
            .landmarks()
            .map(|(id, landmark)| (id, landmark.position))
            .collect();
        points.sort_by_key(|&(id, _)| id);
        points
    }

    /// Poses of every viewpoint ever admitted, in id order. Evicted
    /// viewpoints stay in this log; poses are historical record.
    pub fn export_poses(&self) -> Vec<(ViewpointId, Pose)> {
        self.poses.iter().map(|(&id, &pose)| (id, pose)).collect()
    }

    /// First frame: becomes the reference viewpoint at the identity.
    fn admit_reference(&mut self, features: FeatureSet) -> FrameSummary {
        let num_keypoints = features.len();
        let viewpoint = self.window.add_new();
        self.poses.insert(viewpoint, Pose::identity());
        self.features.insert(viewpoint, features);
        self.state = PipelineState::OneKeyframe;
        info!(
            "[Pipeline] stored reference viewpoint {} ({} keypoints)",
            viewpoint, num_keypoints
        );

        let mut summary = FrameSummary::empty(viewpoint, self.state, Pose::identity());
        summary.num_keypoints = num_keypoints;
        summary
    }

    /// Second frame: two-view initialization against the reference.
    fn bootstrap_frame(&mut self, features: FeatureSet) -> Result<FrameSummary, FrameError> {
        let reference = self.window.active()[0];
        let matches = {
            let ref_feats = self
                .features
                .get(&reference)
                .expect("active viewpoint must retain features");
            self.matcher
                .match_descriptors(&ref_feats.descriptors, &features.descriptors)
        };
        if matches.len() < self.config.min_matches {
            return Err(FrameError::NotEnoughInliers {
                found: matches.len(),
                required: self.config.min_matches,
            });
        }

        let result = {
            let ref_feats = self
                .features
                .get(&reference)
                .expect("active viewpoint must retain features");
            self.estimator
                .bootstrap(&ref_feats.keypoints, &features.keypoints, &matches)?
        };

        // Commit: admit the viewpoint and build the initial map.
        let num_keypoints = features.len();
        let viewpoint = self.window.add_new();
        self.poses.insert(reference, result.pose0);
        self.poses.insert(viewpoint, result.pose1);
        self.features.insert(viewpoint, features);

        let mut created = 0usize;
        for (point, &match_idx) in result.points.iter().zip(result.valid_matches.iter()) {
            let (k0, k1) = matches[match_idx];
            let key0 = ObservationKey::new(reference, k0);
            let key1 = ObservationKey::new(viewpoint, k1);
            // A matcher may emit the same index twice; first pair wins.
            if self.tracks.lookup(key0).is_some() || self.tracks.lookup(key1).is_some() {
                continue;
            }
            let landmark = self.tracks.create_landmark(*point, reference);
            self.bind_or_skip(key0, landmark);
            self.bind_or_skip(key1, landmark);
            created += 1;
        }

        self.state = PipelineState::Bootstrapped;
        info!(
            "[Pipeline] bootstrapped {} -> {}: {} landmarks from {} matches",
            reference,
            viewpoint,
            created,
            matches.len()
        );

        Ok(FrameSummary {
            viewpoint,
            state: self.state,
            pose: result.pose1,
            num_keypoints,
            num_matches: matches.len(),
            num_correspondences: result.valid_matches.len(),
            num_inliers: result.valid_matches.len(),
            new_landmarks: created,
            new_associations: 0,
            skipped_invalid_depth: 0,
            conflicts: Vec::new(),
            evicted: None,
            refined: false,
        })
    }

    /// Steady-state frame: localize against the map, then extend it.
    fn track_frame(&mut self, features: FeatureSet) -> Result<FrameSummary, FrameError> {
        let next_id = self.window.peek_next();

        // Match against every active viewpoint, oldest first.
        let mut edges = Vec::new();
        for &vp in self.window.active() {
            let active_feats = self
                .features
                .get(&vp)
                .expect("active viewpoint must retain features");
            let matches = self
                .matcher
                .match_descriptors(&features.descriptors, &active_feats.descriptors);
            // Viewpoints with too thin a match set contribute nothing.
            if matches.len() < self.config.min_matches {
                continue;
            }
            for (new_idx, active_idx) in matches {
                edges.push((
                    ObservationKey::new(next_id, new_idx),
                    ObservationKey::new(vp, active_idx),
                ));
            }
        }
        let num_matches = edges.len();

        let resolution = self.tracks.resolve_match_set(&edges);

        // Tracks that already carry a landmark give 3D-2D
        // correspondences for pose solving. Latent tracks wait for the
        // solved pose before triangulation.
        let mut pnp_points = Vec::new();
        let mut pnp_keypoints = Vec::new();
        for track in &resolution.tracks {
            let Some(landmark) = track.landmark else {
                continue;
            };
            let Some(new_member) = track
                .observations
                .iter()
                .find(|key| key.viewpoint == next_id)
            else {
                continue;
            };
            let position = self
                .tracks
                .landmark(landmark)
                .expect("resolved track landmark must be live")
                .position;
            pnp_points.push(position);
            pnp_keypoints.push(features.keypoints[new_member.keypoint]);
        }

        let solved = self.estimator.estimate(&pnp_points, &pnp_keypoints)?;
        let pose = solved.pose;

        // Commit: admit the viewpoint, then apply the resolved tracks.
        let num_keypoints = features.len();
        let viewpoint = self.window.add_new();
        debug_assert_eq!(viewpoint, next_id);
        self.poses.insert(viewpoint, pose);
        self.features.insert(viewpoint, features);

        let mut new_landmarks = 0usize;
        let mut new_associations = 0usize;
        let mut skipped_invalid_depth = 0usize;

        for track in &resolution.tracks {
            match track.landmark {
                Some(landmark) => {
                    for &key in &track.observations {
                        if self.tracks.lookup(key).is_none() && self.bind_or_skip(key, landmark) {
                            new_associations += 1;
                        }
                    }
                }
                None => {
                    // Triangulate latent tracks against the oldest
                    // active member; members are sorted, so the anchor
                    // is the front entry.
                    let anchor = track.observations[0];
                    if anchor.viewpoint == viewpoint {
                        continue;
                    }
                    let Some(new_member) = track
                        .observations
                        .iter()
                        .find(|key| key.viewpoint == viewpoint)
                    else {
                        continue;
                    };
                    let anchor_pose = self.poses[&anchor.viewpoint];
                    let anchor_kp = self.features[&anchor.viewpoint].keypoints[anchor.keypoint];
                    let new_kp = self.features[&viewpoint].keypoints[new_member.keypoint];
                    match self
                        .triangulator
                        .triangulate_pair(&anchor_pose, &pose, &anchor_kp, &new_kp)
                    {
                        Ok(position) => {
                            let landmark =
                                self.tracks.create_landmark(position, anchor.viewpoint);
                            for &key in &track.observations {
                                self.bind_or_skip(key, landmark);
                            }
                            new_landmarks += 1;
                        }
                        Err(err) => {
                            skipped_invalid_depth += 1;
                            debug!("[Pipeline] dropping latent track at {}: {}", anchor, err);
                        }
                    }
                }
            }
        }

        let evicted = self.window.evict_if_over(self.config.max_active_keyframes);
        if let Some(old) = evicted {
            let pruned = self.tracks.prune_viewpoint(old);
            self.features.remove(&old);
            debug!("[Pipeline] evicted {} ({} bindings pruned)", old, pruned);
        }

        let refined = if self.window.len() >= self.config.ba_min_keyframes {
            self.refine_window()
        } else {
            false
        };

        self.state = PipelineState::Tracking;
        debug!(
            "[Pipeline] {}: {} matches, {} correspondences, {} inliers, +{} landmarks, +{} associations, {} conflicts",
            viewpoint,
            num_matches,
            pnp_points.len(),
            solved.num_inliers,
            new_landmarks,
            new_associations,
            resolution.conflicts.len()
        );

        Ok(FrameSummary {
            viewpoint,
            state: self.state,
            pose,
            num_keypoints,
            num_matches,
            num_correspondences: pnp_points.len(),
            num_inliers: solved.num_inliers,
            new_landmarks,
            new_associations,
            skipped_invalid_depth,
            conflicts: resolution.conflicts,
            evicted,
            refined,
        })
    }

    /// Bundle-adjust the active window in place. Returns whether
    /// refined estimates were applied.
    fn refine_window(&mut self) -> bool {
        let active = self.window.active();
        let landmark_ids = self.tracks.active_landmarks(active);
        if landmark_ids.is_empty() {
            return false;
        }

        let mut observations = Vec::new();
        for &vp in active {
            let feats = self
                .features
                .get(&vp)
                .expect("active viewpoint must retain features");
            for (keypoint, landmark) in self.tracks.bindings_for_viewpoint(vp) {
                observations.push(BaObservation {
                    viewpoint: vp,
                    landmark,
                    keypoint: feats.keypoints[keypoint],
                });
            }
        }
        let initial_poses: Vec<(ViewpointId, Pose)> =
            active.iter().map(|&vp| (vp, self.poses[&vp])).collect();
        let initial_points: Vec<(LandmarkId, Vector3<f64>)> = landmark_ids
            .iter()
            .map(|&id| {
                let position = self
                    .tracks
                    .landmark(id)
                    .expect("active landmark must be live")
                    .position;
                (id, position)
            })
            .collect();

        let Some(solution) = self
            .adjuster
            .optimize(&observations, &initial_poses, &initial_points)
        else {
            debug!("[Pipeline] window refinement skipped");
            return false;
        };

        for &(vp, pose) in &solution.poses {
            self.poses.insert(vp, pose);
        }
        for &(id, position) in &solution.points {
            if let Some(landmark) = self.tracks.landmark_mut(id) {
                landmark.position = position;
            }
        }
        debug!(
            "[Pipeline] refined {} poses, {} landmarks: error {:.3e} -> {:.3e}",
            solution.poses.len(),
            solution.points.len(),
            solution.initial_error,
            solution.final_error
        );
        true
    }

    /// Apply one binding, tolerating per-pair rejection. A duplicate
    /// observation of a landmark within the new frame is the common
    /// cause; the pair is skipped and logged.
    fn bind_or_skip(&mut self, key: ObservationKey, landmark: LandmarkId) -> bool {
        match self.tracks.bind(key, landmark) {
            Ok(()) => true,
            Err(err) => {
                debug!("[Pipeline] skipping bind {} -> {:?}: {}", key, landmark, err);
                false
            }
        }
    }
}
