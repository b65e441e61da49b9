//! Map state: landmarks, the observation binding table, and the active
//! keyframe window.

pub mod landmark;
pub mod track_graph;
pub mod types;
pub mod window;

pub use landmark::Landmark;
pub use track_graph::{
    ConflictError, MatchResolution, ResolvedTrack, TrackConflict, TrackGraph,
};
pub use types::{LandmarkId, ObservationKey, ViewpointId};
pub use window::KeyframeWindow;
