//! Per-frame results and diagnostics.
//!
//! These types describe what happened while processing one frame:
//! - whether the frame was admitted and under which state transition
//! - correspondence, landmark, and conflict counts
//! - whether bundle adjustment ran and improved the window
//!
//! Frame rejection is a recoverable condition reported through
//! [`FrameError`]; the pipeline state is untouched when a frame is
//! rejected.

use thiserror::Error;

use crate::geometry::{Pose, PoseError};
use crate::map::{TrackConflict, ViewpointId};
use crate::pipeline::PipelineState;

/// Why a frame was dropped. Both variants are recoverable: the caller
/// may simply feed the next frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Too few features extracted to be worth matching.
    #[error("frame has {found} keypoints, need at least {required}")]
    InsufficientKeypoints { found: usize, required: usize },
    /// Matching or pose solving fell below threshold.
    #[error("frame localization failed: {found} usable correspondences, need {required}")]
    NotEnoughInliers { found: usize, required: usize },
}

impl From<PoseError> for FrameError {
    fn from(err: PoseError) -> Self {
        match err {
            PoseError::NotEnoughInliers { found, required } => {
                Self::NotEnoughInliers { found, required }
            }
        }
    }
}

/// Summary of one accepted frame.
#[derive(Debug, Clone)]
pub struct FrameSummary {
    /// Identity assigned to the new viewpoint.
    pub viewpoint: ViewpointId,
    /// Pipeline state after this frame.
    pub state: PipelineState,
    /// Estimated world-to-camera pose of the new viewpoint.
    pub pose: Pose,
    /// Number of calibrated keypoints in the frame.
    pub num_keypoints: usize,
    /// Total match edges against the active window.
    pub num_matches: usize,
    /// 3D-2D correspondences fed to the pose solver.
    pub num_correspondences: usize,
    /// Inliers retained by the pose solver.
    pub num_inliers: usize,
    /// Landmarks created by triangulation this frame.
    pub new_landmarks: usize,
    /// Fresh observation bindings to pre-existing landmarks.
    pub new_associations: usize,
    /// Match pairs dropped for failing the chirality check.
    pub skipped_invalid_depth: usize,
    /// Track conflicts detected while resolving this frame's matches.
    /// Conflicts never fail the frame; the offending merges are skipped.
    pub conflicts: Vec<TrackConflict>,
    /// Viewpoint evicted from the active window, if the bound was hit.
    pub evicted: Option<ViewpointId>,
    /// Whether bundle adjustment ran and its output was applied.
    pub refined: bool,
}

impl FrameSummary {
    /// A summary with all counters zeroed, for the pre-map states
    /// where most of the pipeline does not run.
    pub(crate) fn empty(viewpoint: ViewpointId, state: PipelineState, pose: Pose) -> Self {
        Self {
            viewpoint,
            state,
            pose,
            num_keypoints: 0,
            num_matches: 0,
            num_correspondences: 0,
            num_inliers: 0,
            new_landmarks: 0,
            new_associations: 0,
            skipped_invalid_depth: 0,
            conflicts: Vec::new(),
            evicted: None,
            refined: false,
        }
    }
}
