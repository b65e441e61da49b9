//! Core identity types for the reconstruction map.

use slotmap::new_key_type;

/// Unique identifier for a Viewpoint (a processed, accepted frame).
///
/// ViewpointIds are assigned sequentially by the keyframe window. They
/// serve as lightweight handles for cross-referencing without needing
/// Arc/Rc, which simplifies ownership and avoids cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewpointId(pub u64);

impl ViewpointId {
    /// Create a new ViewpointId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ViewpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VP{}", self.0)
    }
}

new_key_type! {
    /// Stable, generation-checked handle to a landmark in the track
    /// graph arena. Remains valid as other landmarks are added or
    /// removed; a handle to a removed landmark simply fails lookups
    /// instead of aliasing a new entry.
    pub struct LandmarkId;
}

/// A single observation slot: one keypoint index within one viewpoint.
///
/// This is the key of the track graph's sparse binding table. Each key
/// binds to at most one landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservationKey {
    pub viewpoint: ViewpointId,
    pub keypoint: usize,
}

impl ObservationKey {
    pub fn new(viewpoint: ViewpointId, keypoint: usize) -> Self {
        Self { viewpoint, keypoint }
    }
}

impl std::fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.viewpoint, self.keypoint)
    }
}
