//! Nonlinear refinement of poses and landmarks.
//!
//! Gauss-Newton bundle adjustment over the active window, with the
//! landmark block eliminated through a Schur complement.

pub mod local_ba;

pub use local_ba::{
    BaObservation, BaSolution, BundleAdjuster, GaussNewtonAdjuster, LocalBaConfig,
};
