#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Bundle adjustment over metric and projective scenes.
pub mod bundle;

/// Cooperative cancellation of long running reconstructions.
pub mod cancel;

/// Configuration of every stage of the pipeline.
pub mod config;

/// Scoring of pairwise epipolar relationships.
pub mod epipolar;

/// Error types.
pub mod error;

/// Multiple view geometry primitives and solvers.
pub mod geometry;

/// Pairwise and working scene graphs.
pub mod graph;

/// Access to image features and matches.
pub mod lookup;

/// Reconstruction stages and the end-to-end driver.
pub mod pipeline;

/// Outlier pruning of metric scenes.
pub mod prune;

/// Sparse scene structure used for bundle adjustment and output.
pub mod structure;

#[cfg(test)]
pub(crate) mod synthetic;

pub use cancel::CancelToken;
pub use config::ConfigSfm;
pub use error::{GeometryError, LookupError, SfmError};
pub use pipeline::reconstruct::{CameraPrior, Reconstruction, SparseReconstruction};
