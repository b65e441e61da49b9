//! TrackGraph - the association table between observations and landmarks.
//!
//! The graph owns two structures kept in lockstep: an arena of
//! landmarks addressed by stable handles, and a sparse binding table
//! from `(viewpoint, keypoint_index)` to landmark handle. Binding is
//! functional: each observation slot refers to at most one landmark,
//! and a landmark occupies at most one keypoint slot per viewpoint.
//!
//! Match evidence arrives as batches of pairwise edges. The graph
//! resolves a batch into tracks with a disjoint-set closure, so two
//! observations land in the same track whenever any chain of matches
//! connects them, independent of edge order. Tracks that would merge
//! two different existing landmarks are reported as conflicts and left
//! untouched; fusing landmarks is not part of the incremental path.

use std::cmp::Ordering;
use std::collections::HashMap;

use nalgebra::Vector3;
use slotmap::SlotMap;
use thiserror::Error;
use tracing::warn;

use super::landmark::Landmark;
use super::types::{LandmarkId, ObservationKey, ViewpointId};

/// Rejected bind. Both variants mean the caller tried to violate the
/// functional binding constraint; existing state is never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// The observation slot is already bound to a different landmark.
    #[error("{key} is already bound to {existing:?}, refusing rebind to {incoming:?}")]
    Rebind {
        key: ObservationKey,
        existing: LandmarkId,
        incoming: LandmarkId,
    },
    /// The landmark is already observed by this viewpoint at a
    /// different keypoint index.
    #[error(
        "{landmark:?} is already observed by {viewpoint} at keypoint {existing}, \
         refusing duplicate at keypoint {incoming}"
    )]
    DuplicateInViewpoint {
        landmark: LandmarkId,
        viewpoint: ViewpointId,
        existing: usize,
        incoming: usize,
    },
}

/// A resolved track from one match batch: the connected component of
/// observation keys, plus the landmark it already belongs to (if any
/// member was bound before resolution).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTrack {
    /// Member observation keys, sorted.
    pub observations: Vec<ObservationKey>,
    /// `Some` when exactly one existing landmark claims this track:
    /// unbound members should be associated to it. `None` means the
    /// track is latent and needs triangulation before it has a
    /// landmark.
    pub landmark: Option<LandmarkId>,
}

/// A track whose members are already bound to two or more distinct
/// landmarks. The merge is skipped; this record is the diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackConflict {
    /// The disagreeing landmarks, sorted.
    pub landmarks: Vec<LandmarkId>,
    /// Member observation keys of the conflicted track, sorted.
    pub observations: Vec<ObservationKey>,
}

/// Output of [`TrackGraph::resolve_match_set`]: the track partition of
/// a match batch, with conflicted components split out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResolution {
    pub tracks: Vec<ResolvedTrack>,
    pub conflicts: Vec<TrackConflict>,
}

/// Association table between keypoint observations and 3D landmarks.
#[derive(Debug)]
pub struct TrackGraph {
    landmarks: SlotMap<LandmarkId, Landmark>,
    bindings: HashMap<ObservationKey, LandmarkId>,
}

impl Default for TrackGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackGraph {
    pub fn new() -> Self {
        Self {
            landmarks: SlotMap::with_key(),
            bindings: HashMap::new(),
        }
    }

    /// Insert a new landmark into the arena and return its handle.
    pub fn create_landmark(
        &mut self,
        position: Vector3<f64>,
        first_viewpoint: ViewpointId,
    ) -> LandmarkId {
        self.landmarks.insert(Landmark::new(position, first_viewpoint))
    }

    /// Bind an observation slot to a landmark.
    ///
    /// Re-binding the same pair is a no-op. Binding a slot that already
    /// refers to a different landmark, or a landmark already observed
    /// elsewhere in the same viewpoint, fails without mutating state.
    pub fn bind(&mut self, key: ObservationKey, landmark: LandmarkId) -> Result<(), ConflictError> {
        if let Some(&existing) = self.bindings.get(&key) {
            if existing == landmark {
                return Ok(());
            }
            return Err(ConflictError::Rebind {
                key,
                existing,
                incoming: landmark,
            });
        }

        // A stale handle here means the caller holds an id for a
        // landmark that was never created or was removed. That is a
        // bug in the caller, not a recoverable condition.
        let entry = self
            .landmarks
            .get_mut(landmark)
            .expect("bind target must be a live landmark handle");

        if let Some(existing_kp) = entry.keypoint_in(key.viewpoint) {
            if existing_kp != key.keypoint {
                return Err(ConflictError::DuplicateInViewpoint {
                    landmark,
                    viewpoint: key.viewpoint,
                    existing: existing_kp,
                    incoming: key.keypoint,
                });
            }
        }

        entry.add_observation(key.viewpoint, key.keypoint);
        self.bindings.insert(key, landmark);
        Ok(())
    }

    /// Landmark bound to this observation slot, if any.
    pub fn lookup(&self, key: ObservationKey) -> Option<LandmarkId> {
        self.bindings.get(&key).copied()
    }

    /// Whether this observation slot already refers to a landmark.
    pub fn is_triangulated(&self, key: ObservationKey) -> bool {
        self.bindings.contains_key(&key)
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(id)
    }

    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(id)
    }

    /// All landmarks in the arena, in unspecified order.
    pub fn landmarks(&self) -> impl Iterator<Item = (LandmarkId, &Landmark)> {
        self.landmarks.iter()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn num_bindings(&self) -> usize {
        self.bindings.len()
    }

    /// Bindings of one viewpoint as `(keypoint_index, landmark)` pairs,
    /// sorted by keypoint index.
    pub fn bindings_for_viewpoint(&self, viewpoint: ViewpointId) -> Vec<(usize, LandmarkId)> {
        let mut out: Vec<_> = self
            .bindings
            .iter()
            .filter(|(key, _)| key.viewpoint == viewpoint)
            .map(|(key, &landmark)| (key.keypoint, landmark))
            .collect();
        out.sort_unstable_by_key(|&(keypoint, _)| keypoint);
        out
    }

    /// Landmarks with at least one binding among the given viewpoints,
    /// sorted by handle. This is the active-window view: evicted
    /// viewpoints' landmarks drop out once their last active
    /// observation is pruned, even though they stay in the arena.
    pub fn active_landmarks(&self, active: &[ViewpointId]) -> Vec<LandmarkId> {
        let mut out: Vec<_> = self
            .landmarks
            .iter()
            .filter(|(_, landmark)| landmark.observed_by_any(active))
            .map(|(id, _)| id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Remove every binding of an evicted viewpoint. Landmarks are kept
    /// even when their observation count drops to zero; they remain in
    /// the exported map. Returns the number of bindings removed.
    pub fn prune_viewpoint(&mut self, viewpoint: ViewpointId) -> usize {
        let mut touched = Vec::new();
        self.bindings.retain(|key, &mut landmark| {
            if key.viewpoint == viewpoint {
                touched.push(landmark);
                false
            } else {
                true
            }
        });

        for &landmark in &touched {
            if let Some(entry) = self.landmarks.get_mut(landmark) {
                entry.erase_observation(viewpoint);
            }
        }
        touched.len()
    }

    /// Partition a batch of pairwise match edges into tracks.
    ///
    /// Two observation keys end up in the same track whenever any chain
    /// of edges connects them (disjoint-set closure over the whole
    /// batch). Components claimed by exactly one existing landmark come
    /// back as association candidates; components claimed by none are
    /// latent and await triangulation; components claimed by several
    /// distinct landmarks are reported as conflicts and excluded.
    ///
    /// Read-only: no binding is applied here. Output ordering is
    /// canonical (sorted), so any permutation of the same edges yields
    /// an identical resolution.
    pub fn resolve_match_set(
        &self,
        edges: &[(ObservationKey, ObservationKey)],
    ) -> MatchResolution {
        let mut index: HashMap<ObservationKey, usize> = HashMap::new();
        let mut keys: Vec<ObservationKey> = Vec::new();
        for &(a, b) in edges {
            for key in [a, b] {
                index.entry(key).or_insert_with(|| {
                    keys.push(key);
                    keys.len() - 1
                });
            }
        }

        let mut sets = DisjointSet::new(keys.len());
        for &(a, b) in edges {
            sets.union(index[&a], index[&b]);
        }

        let mut components: HashMap<usize, Vec<ObservationKey>> = HashMap::new();
        for (i, &key) in keys.iter().enumerate() {
            components.entry(sets.find(i)).or_default().push(key);
        }

        let mut tracks = Vec::new();
        let mut conflicts = Vec::new();
        for (_, mut observations) in components {
            observations.sort_unstable();

            let mut landmarks: Vec<LandmarkId> = observations
                .iter()
                .filter_map(|&key| self.lookup(key))
                .collect();
            landmarks.sort_unstable();
            landmarks.dedup();

            match landmarks.len() {
                0 => tracks.push(ResolvedTrack {
                    observations,
                    landmark: None,
                }),
                1 => tracks.push(ResolvedTrack {
                    observations,
                    landmark: Some(landmarks[0]),
                }),
                _ => {
                    warn!(
                        "[TrackGraph] conflict: {} observations link {} distinct landmarks, skipping merge",
                        observations.len(),
                        landmarks.len()
                    );
                    conflicts.push(TrackConflict {
                        landmarks,
                        observations,
                    });
                }
            }
        }

        tracks.sort_unstable_by_key(|track| track.observations[0]);
        conflicts.sort_unstable_by_key(|conflict| conflict.observations[0]);
        MatchResolution { tracks, conflicts }
    }
}

/// Disjoint-set forest with union by rank and path halving.
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        match self.rank[root_a].cmp(&self.rank[root_b]) {
            Ordering::Less => self.parent[root_a] = root_b,
            Ordering::Greater => self.parent[root_b] = root_a,
            Ordering::Equal => {
                self.parent[root_b] = root_a;
                self.rank[root_a] += 1;
            }
        }
    }
}

#[cfg(test)]
#[derive(Debug, Error)]
pub(crate) enum TrackInvariantError {
    #[error("binding {key} references missing landmark {landmark:?}")]
    BindingMissingLandmark {
        key: ObservationKey,
        landmark: LandmarkId,
    },
    #[error("binding {key} -> {landmark:?} has no matching backref (found {found:?})")]
    BindingBackrefMismatch {
        key: ObservationKey,
        landmark: LandmarkId,
        found: Option<usize>,
    },
    #[error("observation {key} of {landmark:?} has no forward binding (found {found:?})")]
    ObservationMissingBinding {
        key: ObservationKey,
        landmark: LandmarkId,
        found: Option<LandmarkId>,
    },
}

/// Verify that the binding table and the landmarks' observation tables
/// describe the same bipartite relation.
#[cfg(test)]
pub(crate) fn assert_track_invariants(graph: &TrackGraph) -> Result<(), TrackInvariantError> {
    for (&key, &landmark) in &graph.bindings {
        let Some(entry) = graph.landmarks.get(landmark) else {
            return Err(TrackInvariantError::BindingMissingLandmark { key, landmark });
        };
        let found = entry.keypoint_in(key.viewpoint);
        if found != Some(key.keypoint) {
            return Err(TrackInvariantError::BindingBackrefMismatch {
                key,
                landmark,
                found,
            });
        }
    }

    for (landmark, entry) in graph.landmarks.iter() {
        for (&viewpoint, &keypoint) in &entry.observations {
            let key = ObservationKey::new(viewpoint, keypoint);
            let found = graph.lookup(key);
            if found != Some(landmark) {
                return Err(TrackInvariantError::ObservationMissingBinding {
                    key,
                    landmark,
                    found,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(vp: u64, kp: usize) -> ObservationKey {
        ObservationKey::new(ViewpointId::new(vp), kp)
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut graph = TrackGraph::new();
        let landmark =
            graph.create_landmark(Vector3::new(0.0, 0.0, 5.0), ViewpointId::new(0));

        graph.bind(key(0, 3), landmark).unwrap();

        assert_eq!(graph.lookup(key(0, 3)), Some(landmark));
        assert!(graph.is_triangulated(key(0, 3)));
        assert_eq!(graph.lookup(key(0, 4)), None);
        assert!(!graph.is_triangulated(key(1, 3)));
        assert_track_invariants(&graph).expect("invariants");
    }

    #[test]
    fn test_bind_is_idempotent() {
        let mut graph = TrackGraph::new();
        let landmark =
            graph.create_landmark(Vector3::new(1.0, 0.0, 4.0), ViewpointId::new(0));

        graph.bind(key(0, 7), landmark).unwrap();
        graph.bind(key(0, 7), landmark).unwrap();

        assert_eq!(graph.num_bindings(), 1);
        assert_eq!(
            graph.landmark(landmark).unwrap().num_observations(),
            1
        );
        assert_track_invariants(&graph).expect("invariants");
    }

    #[test]
    fn test_rebind_to_different_landmark_fails() {
        let mut graph = TrackGraph::new();
        let first = graph.create_landmark(Vector3::zeros(), ViewpointId::new(0));
        let second = graph.create_landmark(Vector3::zeros(), ViewpointId::new(1));

        graph.bind(key(0, 2), first).unwrap();
        let err = graph.bind(key(0, 2), second).unwrap_err();

        assert_eq!(
            err,
            ConflictError::Rebind {
                key: key(0, 2),
                existing: first,
                incoming: second,
            }
        );
        // The original binding is untouched.
        assert_eq!(graph.lookup(key(0, 2)), Some(first));
        assert_track_invariants(&graph).expect("invariants");
    }

    #[test]
    fn test_duplicate_landmark_in_viewpoint_fails() {
        let mut graph = TrackGraph::new();
        let landmark = graph.create_landmark(Vector3::zeros(), ViewpointId::new(0));

        graph.bind(key(0, 3), landmark).unwrap();
        let err = graph.bind(key(0, 9), landmark).unwrap_err();

        assert_eq!(
            err,
            ConflictError::DuplicateInViewpoint {
                landmark,
                viewpoint: ViewpointId::new(0),
                existing: 3,
                incoming: 9,
            }
        );
        assert_eq!(graph.num_bindings(), 1);
        assert_track_invariants(&graph).expect("invariants");
    }

    #[test]
    fn test_prune_viewpoint_keeps_landmarks() {
        let mut graph = TrackGraph::new();
        let landmark =
            graph.create_landmark(Vector3::new(0.5, -0.5, 6.0), ViewpointId::new(0));
        graph.bind(key(0, 1), landmark).unwrap();
        graph.bind(key(1, 8), landmark).unwrap();

        let removed = graph.prune_viewpoint(ViewpointId::new(0));

        assert_eq!(removed, 1);
        assert_eq!(graph.lookup(key(0, 1)), None);
        assert_eq!(graph.lookup(key(1, 8)), Some(landmark));
        assert_eq!(graph.num_landmarks(), 1);
        assert_eq!(graph.landmark(landmark).unwrap().num_observations(), 1);
        assert_track_invariants(&graph).expect("invariants");

        // Pruning the last observer still keeps the landmark itself.
        graph.prune_viewpoint(ViewpointId::new(1));
        assert_eq!(graph.num_landmarks(), 1);
        assert_eq!(graph.landmark(landmark).unwrap().num_observations(), 0);
        assert!(graph.active_landmarks(&[ViewpointId::new(1)]).is_empty());
        assert_track_invariants(&graph).expect("invariants");
    }

    #[test]
    fn test_resolve_transitive_closure() {
        let graph = TrackGraph::new();
        let edges = vec![
            (key(2, 0), key(0, 5)),
            (key(2, 0), key(1, 3)),
            (key(2, 7), key(1, 4)),
        ];

        let resolution = graph.resolve_match_set(&edges);

        assert!(resolution.conflicts.is_empty());
        assert_eq!(resolution.tracks.len(), 2);
        // Sorted canonical order: the chained component first.
        assert_eq!(
            resolution.tracks[0].observations,
            vec![key(0, 5), key(1, 3), key(2, 0)]
        );
        assert_eq!(resolution.tracks[0].landmark, None);
        assert_eq!(
            resolution.tracks[1].observations,
            vec![key(1, 4), key(2, 7)]
        );
    }

    #[test]
    fn test_resolve_is_order_independent() {
        let mut graph = TrackGraph::new();
        let landmark = graph.create_landmark(Vector3::zeros(), ViewpointId::new(0));
        graph.bind(key(0, 5), landmark).unwrap();

        let edges = vec![
            (key(3, 0), key(0, 5)),
            (key(3, 1), key(1, 2)),
            (key(3, 0), key(2, 9)),
            (key(1, 2), key(2, 4)),
        ];

        let baseline = graph.resolve_match_set(&edges);

        let mut reversed = edges.clone();
        reversed.reverse();
        assert_eq!(graph.resolve_match_set(&reversed), baseline);

        let mut rotated = edges.clone();
        rotated.rotate_left(2);
        assert_eq!(graph.resolve_match_set(&rotated), baseline);

        // Flipping edge endpoints must not matter either.
        let flipped: Vec<_> = edges.iter().map(|&(a, b)| (b, a)).collect();
        assert_eq!(graph.resolve_match_set(&flipped), baseline);
    }

    #[test]
    fn test_resolve_associates_single_landmark() {
        let mut graph = TrackGraph::new();
        let landmark =
            graph.create_landmark(Vector3::new(0.2, 0.1, 3.0), ViewpointId::new(0));
        graph.bind(key(0, 1), landmark).unwrap();

        let edges = vec![(key(2, 4), key(0, 1))];
        let resolution = graph.resolve_match_set(&edges);

        assert_eq!(resolution.tracks.len(), 1);
        assert_eq!(resolution.tracks[0].landmark, Some(landmark));
        assert_eq!(
            resolution.tracks[0].observations,
            vec![key(0, 1), key(2, 4)]
        );
    }

    #[test]
    fn test_resolve_reports_conflict_without_fusion() {
        let mut graph = TrackGraph::new();
        let first = graph.create_landmark(Vector3::new(0.0, 0.0, 4.0), ViewpointId::new(0));
        let second = graph.create_landmark(Vector3::new(2.0, 0.0, 4.0), ViewpointId::new(1));
        graph.bind(key(0, 1), first).unwrap();
        graph.bind(key(1, 6), second).unwrap();

        // A match edge claims the two existing landmarks are the same
        // physical point.
        let edges = vec![(key(0, 1), key(1, 6))];
        let resolution = graph.resolve_match_set(&edges);

        assert!(resolution.tracks.is_empty());
        assert_eq!(resolution.conflicts.len(), 1);
        let mut expected = vec![first, second];
        expected.sort_unstable();
        assert_eq!(resolution.conflicts[0].landmarks, expected);

        // No fusion: both landmarks and both bindings are intact.
        assert_eq!(graph.num_landmarks(), 2);
        assert_eq!(graph.lookup(key(0, 1)), Some(first));
        assert_eq!(graph.lookup(key(1, 6)), Some(second));
        assert_track_invariants(&graph).expect("invariants");
    }

    #[test]
    fn test_active_landmarks_filters_by_viewpoint() {
        let mut graph = TrackGraph::new();
        let a = graph.create_landmark(Vector3::zeros(), ViewpointId::new(0));
        let b = graph.create_landmark(Vector3::zeros(), ViewpointId::new(1));
        graph.bind(key(0, 0), a).unwrap();
        graph.bind(key(1, 0), b).unwrap();
        graph.bind(key(2, 1), b).unwrap();

        let active = graph.active_landmarks(&[ViewpointId::new(1), ViewpointId::new(2)]);
        assert_eq!(active, vec![b]);

        let all = graph.active_landmarks(&[ViewpointId::new(0), ViewpointId::new(2)]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_bindings_for_viewpoint_sorted() {
        let mut graph = TrackGraph::new();
        let a = graph.create_landmark(Vector3::zeros(), ViewpointId::new(0));
        let b = graph.create_landmark(Vector3::zeros(), ViewpointId::new(0));
        graph.bind(key(0, 9), a).unwrap();
        graph.bind(key(0, 2), b).unwrap();

        let bindings = graph.bindings_for_viewpoint(ViewpointId::new(0));
        assert_eq!(bindings, vec![(2, b), (9, a)]);
        assert!(graph.bindings_for_viewpoint(ViewpointId::new(5)).is_empty());
    }
}
