//! Per-frame orchestration: the reconstruction state machine.
//!
//! This module ties the geometric solvers, the track graph, and the
//! keyframe window together into the `add(image)` cycle:
//! - frame admission (feature count gate, undistortion)
//! - two-view initialization of the map
//! - steady-state localization and map growth
//! - window eviction and windowed bundle adjustment

pub mod config;
pub mod reconstruction;
pub mod result;
pub mod state;

pub use config::PipelineConfig;
pub use reconstruction::ReconstructionPipeline;
pub use result::{FrameError, FrameSummary};
pub use state::PipelineState;
