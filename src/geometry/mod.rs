//! Multi-view geometry: poses, triangulation, epipolar estimation, PnP.

pub mod epipolar;
pub mod pnp;
pub mod pose;
pub mod so3;
pub mod triangulation;

pub use epipolar::{EssentialRansacConfig, EssentialResult};
pub use pnp::{BootstrapResult, PnpConfig, PnpResult, PoseError, PoseEstimator};
pub use pose::Pose;
pub use triangulation::{
    BatchTriangulation, TriangulationError, Triangulator, TriangulatorConfig,
};
