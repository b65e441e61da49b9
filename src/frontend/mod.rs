//! Frame-facing collaborators: feature extraction, camera calibration,
//! descriptor matching.

pub mod camera;
pub mod extractor;
pub mod features;
pub mod matching;

pub use camera::{CameraModel, PinholeCamera};
pub use extractor::{FeatureExtractor, PassthroughExtractor};
pub use features::{Descriptor, FeatureSet};
pub use matching::{BruteForceMatcher, Matcher};
