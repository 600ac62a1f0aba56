//! Brings triangulations made in the arbitrary scale of a single edge into the
//! scale of the scene and merges them with the existing features.

use nalgebra::Vector3;

use crate::geometry::linalg::median;
use crate::graph::pairwise::{MotionId, ViewId};
use crate::graph::working::{SceneWorkingGraph, StereoPoint, ViewState};

/// Why an edge could not be brought into the scale of the scene.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ScaleError {
    /// The base view is not an endpoint of the motion.
    #[error("view {view} is not an endpoint of motion {motion}")]
    NotAnEndpoint {
        /// The base view.
        view: ViewId,
        /// The motion.
        motion: MotionId,
    },

    /// The base view has no pose yet.
    #[error("view {0} has not been processed")]
    Unprocessed(ViewId),

    /// Not enough points are known both in the scene and on the edge.
    #[error("only {actual} overlapping points, {required} required")]
    TooFewOverlapping {
        /// Minimum overlap.
        required: usize,
        /// Overlap found.
        actual: usize,
    },
}

fn base_observation(src_is_base: bool, point: &StereoPoint) -> (usize, usize) {
    if src_is_base {
        (point.src_obs, point.dst_obs)
    } else {
        (point.dst_obs, point.src_obs)
    }
}

/// Location of an edge point in the frame of the base view, at the edge scale.
fn local_in_base(graph: &SceneWorkingGraph, motion: MotionId, src_is_base: bool, point: &StereoPoint) -> Vector3<f64> {
    if src_is_base {
        point.local
    } else {
        graph.motions[motion].a_to_b.transform(&point.local)
    }
}

/// Scale taking the edge triangulations of `motion` into the frame of `base`.
///
/// The median ratio between the depth of the scene feature and the depth of the
/// edge point, over the edge points whose observation in `base` already has a feature.
pub fn determine_scale(
    graph: &SceneWorkingGraph,
    base: ViewId,
    motion: MotionId,
    min_overlap: usize,
) -> Result<f64, ScaleError> {
    let m = &graph.motions[motion];
    if m.src != base && m.dst != base {
        return Err(ScaleError::NotAnEndpoint { view: base, motion });
    }
    let view = &graph.views[base];
    if view.state() != ViewState::Processed {
        return Err(ScaleError::Unprocessed(base));
    }
    let world_to_base = view.view_to_world.inverse();
    let src_is_base = m.src == base;

    let mut ratios: Vec<f64> = m
        .stereo
        .iter()
        .filter_map(|point| {
            let (obs, _) = base_observation(src_is_base, point);
            let feature = view.features3d.get(obs).copied().flatten()?;
            let scene_depth = world_to_base.transform(&graph.features[feature].world).z;
            let edge_depth = local_in_base(graph, motion, src_is_base, point).z;
            (scene_depth > 0.0 && edge_depth > 0.0).then(|| scene_depth / edge_depth)
        })
        .collect();

    if ratios.len() < min_overlap.max(1) {
        return Err(ScaleError::TooFewOverlapping {
            required: min_overlap,
            actual: ratios.len(),
        });
    }
    median(&mut ratios).ok_or(ScaleError::TooFewOverlapping {
        required: min_overlap,
        actual: 0,
    })
}

/// Merge the edge triangulations of `motion` into the scene at `scale`, seen from `base`.
///
/// A point already owned by a feature overwrites it only when its triangulation
/// angle is strictly larger. The edge list is released afterwards. Returns the
/// number of features created.
pub fn add_triangulated_stereo_features(
    graph: &mut SceneWorkingGraph,
    base: ViewId,
    motion: MotionId,
    scale: f64,
) -> usize {
    let stereo = std::mem::take(&mut graph.motions[motion].stereo);
    let src_is_base = graph.motions[motion].src == base;
    let other = graph.motions[motion].other(base);
    let base_to_world = graph.views[base].view_to_world;

    let mut created = 0;
    for point in &stereo {
        let world = base_to_world.transform(&(local_in_base(graph, motion, src_is_base, point) * scale));
        let (obs_base, obs_other) = base_observation(src_is_base, point);
        let existing = graph.views[base].features3d[obs_base].or(graph.views[other].features3d[obs_other]);
        match existing {
            Some(f) => {
                let feature = &mut graph.features[f];
                if point.triangulation_angle > feature.triangulation_angle {
                    feature.world = world;
                    feature.triangulation_angle = point.triangulation_angle;
                }
                graph.attach(f, base, obs_base);
                graph.attach(f, other, obs_other);
            }
            None => {
                graph.add_feature(world, point.triangulation_angle, &[(base, obs_base), (other, obs_other)]);
                created += 1;
            }
        }
    }
    created
}

/// Merge every edge of `view` that still holds triangulations, when its scale can
/// be determined. Edges that cannot be scaled keep their points for a later attempt.
pub fn add_triangulated_features_for_all_edges(graph: &mut SceneWorkingGraph, view: ViewId, min_overlap: usize) {
    let connections = graph.views[view].connections.clone();
    for m in connections {
        if graph.motions[m].stereo.is_empty() {
            continue;
        }
        match determine_scale(graph, view, m, min_overlap) {
            Ok(scale) => {
                let total = graph.motions[m].stereo.len();
                let created = add_triangulated_stereo_features(graph, view, m, scale);
                log::debug!(
                    target: "kornia_sfm::merge",
                    "edge {m} at scale {scale:.4}: {created} new of {total} points"
                );
            }
            Err(e) => log::warn!(target: "kornia_sfm::merge", "skipping edge {m}: {e}"),
        }
    }
}
