//! Reconstruction state machine.

/// State of the incremental reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No frame accepted yet.
    Empty,
    /// One reference keyframe stored, waiting for a baseline.
    OneKeyframe,
    /// Two-view initialization done, map exists.
    Bootstrapped,
    /// Steady state: localizing against the map.
    Tracking,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Empty
    }
}
