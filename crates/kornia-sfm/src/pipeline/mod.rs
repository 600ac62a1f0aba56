/// Growth of the working graph by robust pose estimation and triangulation.
pub mod expand;

/// Three view projective initialization of a seed cluster.
pub mod initialize;

/// Scale reconciliation of edge local triangulations.
pub mod merge;

/// Metric elevation, bundle adjustment with the sign heuristic and final pruning.
pub mod metric;

/// The end-to-end reconstruction driver.
pub mod reconstruct;

/// Quality scores of pairwise motions and view triples.
pub mod score;

pub use expand::ExpandScene;
pub use initialize::{InlierInfo, ProjectiveInitialization, ProjectiveInitializeAllCommon};
pub use reconstruct::{CameraPrior, Reconstruction, SparseReconstruction};
pub use score::{DefaultScoreMotion, ScoreMotion};

