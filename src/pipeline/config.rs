//! Pipeline configuration.

use crate::geometry::{EssentialRansacConfig, PnpConfig, TriangulatorConfig};

/// Tunable parameters of the reconstruction pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum keypoint count for a frame to be considered at all.
    pub min_keypoints: usize,
    /// Minimum match count against one active viewpoint for its
    /// matches to be used at all; also gates two-view initialization.
    pub min_matches: usize,
    /// Maximum number of viewpoints kept in the active window.
    pub max_active_keyframes: usize,
    /// Minimum active window size before bundle adjustment runs.
    pub ba_min_keyframes: usize,
    pub pnp: PnpConfig,
    pub essential: EssentialRansacConfig,
    pub triangulator: TriangulatorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_keypoints: 8,
            min_matches: 60,
            max_active_keyframes: 8,
            ba_min_keyframes: 3,
            pnp: PnpConfig::default(),
            essential: EssentialRansacConfig::default(),
            triangulator: TriangulatorConfig::default(),
        }
    }
}
