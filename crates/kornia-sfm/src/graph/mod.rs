/// Pairwise graph generation from an image database.
pub mod generate;

/// Graph of views connected by validated two-view motions.
pub mod pairwise;

/// Incremental metric reconstruction state.
pub mod working;

pub use generate::GeneratePairwiseImageGraph;
pub use pairwise::{MotionId, PairwiseImageGraph, PairwiseMotion, PairwiseView, ViewId};
pub use working::{Feature3D, SceneWorkingGraph, ViewState, WorkingMotion, WorkingView};
