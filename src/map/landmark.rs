//! Landmark - a 3D point observed from one or more viewpoints.
//!
//! Landmarks are the sparse structure elements of the reconstruction.
//! Each landmark records which viewpoints observe it and at which
//! keypoint index, so eviction can prune bindings without destroying
//! the point itself.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::ViewpointId;

/// A 3D landmark shared by every viewpoint that observes it.
///
/// The observation table maps an observing viewpoint to the keypoint
/// index within that viewpoint, so a landmark appears at most once per
/// frame.
#[derive(Debug, Clone)]
pub struct Landmark {
    /// 3D position in the world frame.
    pub position: Vector3<f64>,

    /// Observing viewpoints, mapped to the keypoint index in that
    /// viewpoint. observations[vp_id] = keypoint_idx.
    pub observations: HashMap<ViewpointId, usize>,

    /// Viewpoint whose triangulation created this landmark.
    pub first_viewpoint: ViewpointId,
}

impl Landmark {
    /// Create a new landmark with no observations yet.
    ///
    /// # Arguments
    /// * `position` - 3D position in the world frame
    /// * `first_viewpoint` - viewpoint that triangulated this point
    pub fn new(position: Vector3<f64>, first_viewpoint: ViewpointId) -> Self {
        Self {
            position,
            observations: HashMap::new(),
            first_viewpoint,
        }
    }

    /// Record an observation from a viewpoint.
    pub fn add_observation(&mut self, viewpoint: ViewpointId, keypoint_index: usize) {
        self.observations.insert(viewpoint, keypoint_index);
    }

    /// Remove an observation.
    ///
    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, viewpoint: ViewpointId) -> bool {
        self.observations.remove(&viewpoint).is_some()
    }

    /// Keypoint index at which `viewpoint` observes this landmark.
    pub fn keypoint_in(&self, viewpoint: ViewpointId) -> Option<usize> {
        self.observations.get(&viewpoint).copied()
    }

    /// Number of viewpoints currently observing this landmark.
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Whether any of the given viewpoints observes this landmark.
    pub fn observed_by_any(&self, viewpoints: &[ViewpointId]) -> bool {
        viewpoints.iter().any(|vp| self.observations.contains_key(vp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_landmark() -> Landmark {
        Landmark::new(Vector3::new(1.0, 2.0, 3.0), ViewpointId::new(0))
    }

    #[test]
    fn test_add_remove_observation() {
        let mut landmark = create_test_landmark();

        landmark.add_observation(ViewpointId::new(1), 5);
        landmark.add_observation(ViewpointId::new(2), 10);

        assert_eq!(landmark.num_observations(), 2);
        assert_eq!(landmark.keypoint_in(ViewpointId::new(1)), Some(5));

        assert!(landmark.erase_observation(ViewpointId::new(1)));
        assert_eq!(landmark.num_observations(), 1);
        assert!(!landmark.erase_observation(ViewpointId::new(1))); // Already removed
    }

    #[test]
    fn test_one_keypoint_per_viewpoint() {
        let mut landmark = create_test_landmark();

        landmark.add_observation(ViewpointId::new(1), 5);
        landmark.add_observation(ViewpointId::new(1), 9);

        // Re-observation replaces the slot, never duplicates it.
        assert_eq!(landmark.num_observations(), 1);
        assert_eq!(landmark.keypoint_in(ViewpointId::new(1)), Some(9));
    }

    #[test]
    fn test_observed_by_any() {
        let mut landmark = create_test_landmark();
        landmark.add_observation(ViewpointId::new(3), 0);

        assert!(landmark.observed_by_any(&[ViewpointId::new(3), ViewpointId::new(4)]));
        assert!(!landmark.observed_by_any(&[ViewpointId::new(4), ViewpointId::new(5)]));
        assert!(!landmark.observed_by_any(&[]));
    }
}
