//! Brute-force descriptor matching between feature sets.

use super::features::Descriptor;

/// Matching thresholds
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const NN_RATIO: f32 = 0.75; // Ratio test threshold (best/second_best)

/// Compute Hamming distance between two binary descriptors (32-byte).
/// Returns the number of differing bits.
pub fn descriptor_distance(desc1: &Descriptor, desc2: &Descriptor) -> u32 {
    let mut hamming_dist = 0u32;
    for i in 0..32 {
        hamming_dist += (desc1[i] ^ desc2[i]).count_ones();
    }
    hamming_dist
}

/// Pairwise descriptor correspondence.
///
/// `match_descriptors(a, b)` returns `(index_in_a, index_in_b)` pairs
/// ordered by the first index. No symmetry with the swapped call is
/// guaranteed.
pub trait Matcher {
    fn match_descriptors(&self, a: &[Descriptor], b: &[Descriptor]) -> Vec<(usize, usize)>;
}

/// Exhaustive Hamming matcher with a nearest-neighbor ratio test and
/// optional mutual cross-check.
#[derive(Debug, Clone, Copy)]
pub struct BruteForceMatcher {
    /// Maximum accepted Hamming distance.
    pub max_distance: u32,
    /// Best/second-best distance ratio below which a match is kept.
    pub nn_ratio: f32,
    /// Require the match to be the best in both directions.
    pub cross_check: bool,
}

impl Default for BruteForceMatcher {
    fn default() -> Self {
        Self {
            max_distance: TH_HIGH,
            nn_ratio: NN_RATIO,
            cross_check: true,
        }
    }
}

impl BruteForceMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Best candidate for `query` in `train`, after the distance and
    /// ratio tests.
    fn best_match(&self, query: &Descriptor, train: &[Descriptor]) -> Option<(usize, u32)> {
        let mut best_idx = None;
        let mut best_dist = u32::MAX;
        let mut second_dist = u32::MAX;

        for (idx, candidate) in train.iter().enumerate() {
            let dist = descriptor_distance(query, candidate);
            if dist < best_dist {
                second_dist = best_dist;
                best_dist = dist;
                best_idx = Some(idx);
            } else if dist < second_dist {
                second_dist = dist;
            }
        }

        let idx = best_idx?;
        if best_dist > self.max_distance {
            return None;
        }
        if second_dist != u32::MAX && best_dist as f32 >= self.nn_ratio * second_dist as f32 {
            return None;
        }
        Some((idx, best_dist))
    }
}

impl Matcher for BruteForceMatcher {
    fn match_descriptors(&self, a: &[Descriptor], b: &[Descriptor]) -> Vec<(usize, usize)> {
        let mut matches = Vec::new();
        for (i, query) in a.iter().enumerate() {
            let Some((j, _)) = self.best_match(query, b) else {
                continue;
            };
            if self.cross_check {
                match self.best_match(&b[j], a) {
                    Some((back, _)) if back == i => {}
                    _ => continue,
                }
            }
            matches.push((i, j));
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Descriptor with `weight` low bits set, spread over the first
    /// bytes. Distinct weights give distinct, well-separated patterns.
    fn descriptor_with_bits(weight: usize) -> Descriptor {
        let mut desc = [0u8; 32];
        for bit in 0..weight {
            desc[bit / 8] |= 1 << (bit % 8);
        }
        desc
    }

    #[test]
    fn test_descriptor_distance_counts_bits() {
        let zeros = [0u8; 32];
        let ones = [0xffu8; 32];

        assert_eq!(descriptor_distance(&zeros, &zeros), 0);
        assert_eq!(descriptor_distance(&zeros, &ones), 256);
        assert_eq!(descriptor_distance(&zeros, &descriptor_with_bits(5)), 5);
    }

    #[test]
    fn test_identical_sets_match_one_to_one() {
        let descriptors: Vec<_> = (0..6).map(|i| descriptor_with_bits(i * 20)).collect();

        let matcher = BruteForceMatcher::new();
        let matches = matcher.match_descriptors(&descriptors, &descriptors);

        assert_eq!(matches.len(), 6);
        for (i, j) in matches {
            assert_eq!(i, j);
        }
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous_match() {
        let query = vec![descriptor_with_bits(40)];
        // Two train descriptors at nearly the same distance from the
        // query: 3 and 4 bits away, so best/second = 0.75 exactly.
        let train = vec![descriptor_with_bits(43), descriptor_with_bits(44)];

        let matcher = BruteForceMatcher::new();
        assert!(matcher.match_descriptors(&query, &train).is_empty());
    }

    #[test]
    fn test_max_distance_rejects_far_match() {
        let query = vec![descriptor_with_bits(0)];
        let train = vec![descriptor_with_bits(200)];

        let matcher = BruteForceMatcher::new();
        assert!(matcher.match_descriptors(&query, &train).is_empty());
    }

    #[test]
    fn test_cross_check_rejects_asymmetric_match() {
        // Two queries close to the same train descriptor: the reverse
        // direction can only pick one of them.
        let a = vec![descriptor_with_bits(40), descriptor_with_bits(44)];
        let b = vec![descriptor_with_bits(41)];

        let matcher = BruteForceMatcher {
            nn_ratio: 1.0,
            ..BruteForceMatcher::new()
        };
        let matches = matcher.match_descriptors(&a, &b);

        assert_eq!(matches, vec![(0, 0)]);
    }
}
