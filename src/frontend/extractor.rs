//! Feature extraction seam.

use super::features::FeatureSet;

/// Produces raw pixel keypoints and descriptors from an input frame.
///
/// Detection is outside this crate; the pipeline only needs something
/// that turns its input type into a [`FeatureSet`].
pub trait FeatureExtractor {
    type Image;

    fn extract(&self, image: &Self::Image) -> FeatureSet;
}

/// Extractor for inputs that already carry keypoints and descriptors,
/// such as synthetic scenes or datasets with precomputed features.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughExtractor;

impl FeatureExtractor for PassthroughExtractor {
    type Image = FeatureSet;

    fn extract(&self, image: &FeatureSet) -> FeatureSet {
        image.clone()
    }
}
