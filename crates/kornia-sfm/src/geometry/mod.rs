/// Camera models and camera matrix decomposition.
pub mod camera;

/// Essential matrix decomposition.
pub mod essential;

/// Normalized 8-point fundamental matrix estimation.
pub mod fundamental;

/// DLT homography estimation.
pub mod homography;

/// Small dense linear algebra helpers.
pub mod linalg;

/// Projective and calibrated pose estimation from 2D-3D correspondences.
pub mod pnp;

/// Generic random sample consensus.
pub mod ransac;

/// Rigid body transforms.
pub mod se3;

/// Linear self-calibration and projective to metric upgrades.
pub mod selfcalib;

/// Two-view and N-view triangulation.
pub mod triangulate;

/// Trifocal tensor estimation and camera extraction.
pub mod trifocal;

pub use camera::{BundleCamera, BundlePinholeSimplified, PinholeCamera};
pub use se3::Se3;

use nalgebra::Vector2;

/// A pair of corresponding observations in two views.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AssociatedPair {
    /// Observation in the first view.
    pub p1: Vector2<f64>,
    /// Observation in the second view.
    pub p2: Vector2<f64>,
}

impl AssociatedPair {
    /// Create a new pair.
    pub fn new(p1: Vector2<f64>, p2: Vector2<f64>) -> Self {
        Self { p1, p2 }
    }
}

/// Corresponding observations in three views.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AssociatedTriple {
    /// Observation in the first view.
    pub p1: Vector2<f64>,
    /// Observation in the second view.
    pub p2: Vector2<f64>,
    /// Observation in the third view.
    pub p3: Vector2<f64>,
}

impl AssociatedTriple {
    /// Create a new triple.
    pub fn new(p1: Vector2<f64>, p2: Vector2<f64>, p3: Vector2<f64>) -> Self {
        Self { p1, p2, p3 }
    }
}
