//! Per-frame feature data: keypoints with aligned binary descriptors.

use nalgebra::Vector2;

/// 256-bit binary descriptor (32 bytes).
pub type Descriptor = [u8; 32];

/// Keypoints and descriptors extracted from one frame.
///
/// `keypoints[i]` and `descriptors[i]` describe the same feature. The
/// coordinates are raw pixels as produced by the extractor; the
/// pipeline converts them to calibrated coordinates through the camera
/// model before they enter the map.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Vector2<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Vector2<f64>>, descriptors: Vec<Descriptor>) -> Self {
        debug_assert_eq!(
            keypoints.len(),
            descriptors.len(),
            "keypoints and descriptors must align"
        );
        Self {
            keypoints,
            descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_set_len() {
        let features = FeatureSet::new(
            vec![Vector2::new(1.0, 2.0), Vector2::new(3.0, 4.0)],
            vec![[0u8; 32], [1u8; 32]],
        );

        assert_eq!(features.len(), 2);
        assert!(!features.is_empty());
        assert!(FeatureSet::default().is_empty());
    }
}
