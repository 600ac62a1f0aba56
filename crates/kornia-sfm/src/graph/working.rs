use nalgebra::{Matrix3, Vector2, Vector3};

use crate::error::SfmError;
use crate::geometry::camera::{BundleCamera, PinholeCamera};
use crate::geometry::se3::Se3;
use crate::graph::pairwise::{MotionId, PairwiseImageGraph, ViewId};
use crate::lookup::{AssociatedIndex, ImageShape, LookUpSimilarImages};

/// Processing state of a view. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViewState {
    /// Not yet reached.
    Unprocessed,
    /// Referenced by a processed neighbor, waiting for its pose.
    Pending,
    /// Pose known.
    Processed,
}

/// A triangulated scene point and the observations it was built from.
///
/// `views` and `obs_idx` are parallel arrays.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature3D {
    /// Location in the world frame.
    pub world: Vector3<f64>,
    /// Largest viewing ray angle it was triangulated with, in radians.
    pub triangulation_angle: f64,
    /// Views observing the point.
    pub views: Vec<ViewId>,
    /// Observation index of the point in each view.
    pub obs_idx: Vec<usize>,
}

impl Feature3D {
    /// Whether `view` observes the point.
    pub fn observes(&self, view: ViewId) -> bool {
        self.views.contains(&view)
    }
}

/// A point triangulated from a single edge, in the frame of its `src` view.
///
/// The scale is the arbitrary scale of the edge until merged.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StereoPoint {
    /// Location in the `src` frame.
    pub local: Vector3<f64>,
    /// Observation index in `src`.
    pub src_obs: usize,
    /// Observation index in `dst`.
    pub dst_obs: usize,
    /// Viewing ray angle, in radians.
    pub triangulation_angle: f64,
}

/// A view of the working reconstruction.
#[derive(Clone, Debug)]
pub struct WorkingView {
    /// Image id.
    pub id: String,
    /// Image dimensions.
    pub shape: ImageShape,
    /// Index into [`SceneWorkingGraph::cameras`].
    pub camera: usize,
    /// Intrinsics for centered pixels.
    pub intrinsics: PinholeCamera,
    /// Centered pixel observations.
    pub pixels: Vec<Vector2<f64>>,
    /// Normalized observations.
    pub norm: Vec<Vector2<f64>>,
    /// View to world transform, valid once processed.
    pub view_to_world: Se3,
    /// Feature owning each observation, if any.
    pub features3d: Vec<Option<usize>>,
    /// Motions touching this view.
    pub connections: Vec<MotionId>,
    state: ViewState,
}

impl WorkingView {
    /// Current processing state.
    pub fn state(&self) -> ViewState {
        self.state
    }
}

/// An edge of the working reconstruction.
#[derive(Clone, Debug)]
pub struct WorkingMotion {
    /// First view.
    pub src: ViewId,
    /// Second view.
    pub dst: ViewId,
    /// Inlier matches, `src` features first.
    pub inliers: Vec<AssociatedIndex>,
    /// Fundamental matrix in centered pixels.
    pub fundamental: Matrix3<f64>,
    /// Whether the pair observes 3D structure.
    pub is_3d: bool,
    /// Score of the 3D verdict.
    pub score_3d: f64,
    /// Transform from `src` to `dst`. Its translation is rescaled on merge.
    pub a_to_b: Se3,
    /// Median triangulation angle of the inliers, in radians.
    pub triangulation_angle: f64,
    /// Points triangulated from this edge alone, freed once merged.
    pub stereo: Vec<StereoPoint>,
    /// Whether the edge was detached from its views.
    pub detached: bool,
}

impl WorkingMotion {
    /// The endpoint which is not `view`.
    pub fn other(&self, view: ViewId) -> ViewId {
        if self.src == view {
            self.dst
        } else {
            self.src
        }
    }

    /// Observation indices `(in view, in other)` of an inlier, oriented from `view`.
    pub fn oriented(&self, view: ViewId, inlier: &AssociatedIndex) -> (usize, usize) {
        if self.src == view {
            (inlier.src, inlier.dst)
        } else {
            (inlier.dst, inlier.src)
        }
    }
}

/// Incremental metric reconstruction: views, edges and the global point set.
///
/// Relations are indices into the flat arrays. A view refers to a feature
/// through `features3d` and the feature refers back through `views`/`obs_idx`.
#[derive(Clone, Debug)]
pub struct SceneWorkingGraph {
    /// Cameras shared by the views.
    pub cameras: Vec<BundleCamera>,
    /// Every view, indexed like the pairwise graph.
    pub views: Vec<WorkingView>,
    /// Every edge, indexed like the pairwise graph.
    pub motions: Vec<WorkingMotion>,
    /// Triangulated points.
    pub features: Vec<Feature3D>,
}

impl SceneWorkingGraph {
    /// Mirror a pairwise graph, loading centered and normalized observations.
    ///
    /// `assignment[v]` gives the camera index and the centered intrinsics of view `v`.
    pub fn new(
        pairwise: &PairwiseImageGraph,
        db: &dyn LookUpSimilarImages,
        cameras: Vec<BundleCamera>,
        assignment: &[(usize, PinholeCamera)],
    ) -> Result<Self, SfmError> {
        let mut views = Vec::with_capacity(pairwise.views.len());
        for (v, view) in pairwise.views.iter().enumerate() {
            let shape = db.lookup_shape(&view.id)?;
            let center = shape.center();
            let pixels: Vec<Vector2<f64>> = db
                .lookup_pixel_feats(&view.id)?
                .iter()
                .map(|p| p - center)
                .collect();
            let (camera, intrinsics) = assignment[v];
            let norm = pixels.iter().map(|p| intrinsics.pixel_to_norm(p)).collect();
            views.push(WorkingView {
                id: view.id.clone(),
                shape,
                camera,
                intrinsics,
                features3d: vec![None; pixels.len()],
                pixels,
                norm,
                view_to_world: Se3::identity(),
                connections: view.connections.clone(),
                state: ViewState::Unprocessed,
            });
        }

        let motions = pairwise
            .motions
            .iter()
            .map(|m| WorkingMotion {
                src: m.src,
                dst: m.dst,
                inliers: m.inliers.clone(),
                fundamental: m.fundamental,
                is_3d: m.is_3d,
                score_3d: m.score_3d,
                a_to_b: Se3::identity(),
                triangulation_angle: 0.0,
                stereo: Vec::new(),
                detached: false,
            })
            .collect();

        Ok(Self {
            cameras,
            views,
            motions,
            features: Vec::new(),
        })
    }

    /// Advance the state of a view. Returns `false` and leaves it unchanged if this would move it backward.
    pub fn set_state(&mut self, view: ViewId, state: ViewState) -> bool {
        let current = &mut self.views[view].state;
        if state < *current {
            return false;
        }
        *current = state;
        true
    }

    /// Add a feature and link every observation back to it.
    ///
    /// Observations whose slot is already taken are left out.
    pub fn add_feature(
        &mut self,
        world: Vector3<f64>,
        triangulation_angle: f64,
        observations: &[(ViewId, usize)],
    ) -> usize {
        let id = self.features.len();
        self.features.push(Feature3D {
            world,
            triangulation_angle,
            views: Vec::with_capacity(observations.len()),
            obs_idx: Vec::with_capacity(observations.len()),
        });
        for &(view, obs) in observations {
            self.attach(id, view, obs);
        }
        id
    }

    /// Link an observation to a feature in both directions.
    ///
    /// Idempotent: nothing happens if the view already observes the feature or
    /// the observation belongs to another feature.
    pub fn attach(&mut self, feature: usize, view: ViewId, obs: usize) -> bool {
        if self.features[feature].observes(view) || self.views[view].features3d[obs].is_some() {
            return false;
        }
        self.views[view].features3d[obs] = Some(feature);
        let f = &mut self.features[feature];
        f.views.push(view);
        f.obs_idx.push(obs);
        true
    }

    /// Detach every edge of a view from both of its endpoints.
    pub fn detach_view(&mut self, view: ViewId) {
        let connections = std::mem::take(&mut self.views[view].connections);
        for m in connections {
            let other = self.motions[m].other(view);
            self.views[other].connections.retain(|&c| c != m);
            let motion = &mut self.motions[m];
            motion.detached = true;
            motion.stereo = Vec::new();
        }
    }

    /// Motion joining `a` and `b`, detached or not.
    pub fn find_motion(&self, a: ViewId, b: ViewId) -> Option<MotionId> {
        self.motions
            .iter()
            .position(|m| (m.src == a && m.dst == b) || (m.src == b && m.dst == a))
    }

    /// Number of inlier observations of `view` whose counterpart already has a feature.
    pub fn count_features_with_3d(&self, view: ViewId) -> usize {
        self.views[view]
            .connections
            .iter()
            .map(|&m| {
                let motion = &self.motions[m];
                let other = &self.views[motion.other(view)];
                motion
                    .inliers
                    .iter()
                    .filter(|inlier| {
                        let (_, idx_other) = motion.oriented(view, inlier);
                        other.features3d[idx_other].is_some()
                    })
                    .count()
            })
            .sum()
    }

    /// Views in the given state.
    pub fn views_in_state(&self, state: ViewState) -> Vec<ViewId> {
        (0..self.views.len())
            .filter(|&v| self.views[v].state == state)
            .collect()
    }

    /// Check the bidirectional links between views, features and edges.
    pub fn is_consistent(&self) -> bool {
        let features_ok = self.features.iter().enumerate().all(|(f, feature)| {
            feature.views.len() == feature.obs_idx.len()
                && feature
                    .views
                    .iter()
                    .zip(&feature.obs_idx)
                    .all(|(&v, &o)| self.views[v].features3d.get(o) == Some(&Some(f)))
        });
        let views_ok = self.views.iter().enumerate().all(|(v, view)| {
            view.features3d.iter().enumerate().all(|(o, slot)| match slot {
                Some(f) => self.features[*f]
                    .views
                    .iter()
                    .zip(&self.features[*f].obs_idx)
                    .any(|(&fv, &fo)| fv == v && fo == o),
                None => true,
            })
        });
        let edges_ok = self.motions.iter().enumerate().all(|(m, motion)| {
            let count = |v: ViewId| self.views[v].connections.iter().filter(|&&c| c == m).count();
            motion.src != motion.dst
                && if motion.detached {
                    count(motion.src) == 0 && count(motion.dst) == 0
                } else {
                    count(motion.src) == 1 && count(motion.dst) == 1
                }
        });
        features_ok && views_ok && edges_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::pairwise::PairwiseMotion;
    use crate::lookup::SimilarImagesDb;

    fn small_graph() -> Result<SceneWorkingGraph, SfmError> {
        let mut db = SimilarImagesDb::new();
        let mut pairwise = PairwiseImageGraph::new();
        for id in ["a", "b", "c"] {
            let feats = (0..5).map(|i| Vector2::new(100.0 + i as f64, 50.0)).collect();
            db.add_image(id, ImageShape::new(200, 100), feats)?;
            pairwise.create_node(id, 5);
        }
        for (src, dst) in [(0, 1), (1, 2)] {
            pairwise.connect(PairwiseMotion {
                src,
                dst,
                is_3d: true,
                score_3d: 1.0,
                fundamental: Matrix3::zeros(),
                inliers: (0..5).map(|i| AssociatedIndex::new(i, i)).collect(),
                count_f: 5,
                count_h: 0,
            });
        }
        let camera = PinholeCamera::from_focal(100.0);
        SceneWorkingGraph::new(
            &pairwise,
            &db,
            vec![BundleCamera::Pinhole(camera)],
            &[(0, camera); 3],
        )
    }

    #[test]
    fn test_loads_centered_observations() -> Result<(), SfmError> {
        let graph = small_graph()?;
        assert_eq!(graph.views[0].pixels[2], Vector2::new(2.0, 0.0));
        assert_eq!(graph.views[0].norm[2], Vector2::new(0.02, 0.0));
        assert_eq!(graph.views[1].connections, vec![0, 1]);
        assert!(graph.is_consistent());
        Ok(())
    }

    #[test]
    fn test_state_is_monotonic() -> Result<(), SfmError> {
        let mut graph = small_graph()?;
        assert!(graph.set_state(0, ViewState::Pending));
        assert!(graph.set_state(0, ViewState::Processed));
        assert!(!graph.set_state(0, ViewState::Pending));
        assert!(!graph.set_state(0, ViewState::Unprocessed));
        assert_eq!(graph.views[0].state(), ViewState::Processed);
        Ok(())
    }

    #[test]
    fn test_attach_is_idempotent() -> Result<(), SfmError> {
        let mut graph = small_graph()?;
        let f = graph.add_feature(Vector3::new(0.0, 0.0, 1.0), 0.2, &[(0, 1), (1, 1)]);
        assert!(!graph.attach(f, 0, 1));
        assert!(!graph.attach(f, 1, 3));
        // slot already owned by f
        let g = graph.add_feature(Vector3::zeros(), 0.1, &[(1, 1), (2, 4)]);
        assert_eq!(graph.features[g].views, vec![2]);
        assert!(graph.attach(f, 2, 1));
        assert_eq!(graph.features[f].views.len(), graph.features[f].obs_idx.len());
        assert_eq!(graph.count_features_with_3d(1), 3);
        assert!(graph.is_consistent());
        Ok(())
    }

    #[test]
    fn test_detach_view() -> Result<(), SfmError> {
        let mut graph = small_graph()?;
        graph.detach_view(2);
        assert!(graph.views[2].connections.is_empty());
        assert_eq!(graph.views[1].connections, vec![0]);
        assert!(graph.motions[1].detached);
        assert!(graph.is_consistent());
        Ok(())
    }
}
