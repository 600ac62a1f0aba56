use std::collections::HashMap;

use nalgebra::Matrix3;

use crate::lookup::AssociatedIndex;

/// Index of a view in [`PairwiseImageGraph::views`].
pub type ViewId = usize;

/// Index of a motion in [`PairwiseImageGraph::motions`].
pub type MotionId = usize;

/// One image in the pairwise graph.
#[derive(Clone, Debug)]
pub struct PairwiseView {
    /// Image id.
    pub id: String,
    /// Number of features detected in the image.
    pub total_observations: usize,
    /// Motions touching this view.
    pub connections: Vec<MotionId>,
}

/// Validated geometric relationship between two distinct views.
#[derive(Clone, Debug)]
pub struct PairwiseMotion {
    /// First view.
    pub src: ViewId,
    /// Second view.
    pub dst: ViewId,
    /// Whether the pair observes 3D structure rather than a homography.
    pub is_3d: bool,
    /// Score of the 3D verdict.
    pub score_3d: f64,
    /// Fundamental matrix from `src` to `dst` in centered pixels.
    pub fundamental: Matrix3<f64>,
    /// Inlier matches, `src` features first.
    pub inliers: Vec<AssociatedIndex>,
    /// Number of fundamental matrix inliers.
    pub count_f: usize,
    /// Number of homography inliers.
    pub count_h: usize,
}

impl PairwiseMotion {
    /// The endpoint which is not `view`.
    pub fn other(&self, view: ViewId) -> ViewId {
        if self.src == view {
            self.dst
        } else {
            self.src
        }
    }

    /// Whether `view` is the first endpoint.
    pub fn is_src(&self, view: ViewId) -> bool {
        self.src == view
    }

    /// Observation indices `(in view, in other)` of an inlier, oriented from `view`.
    pub fn oriented(&self, view: ViewId, inlier: &AssociatedIndex) -> (usize, usize) {
        if self.is_src(view) {
            (inlier.src, inlier.dst)
        } else {
            (inlier.dst, inlier.src)
        }
    }
}

/// Views connected by motions, stored as flat arrays with index relations.
#[derive(Clone, Debug, Default)]
pub struct PairwiseImageGraph {
    /// Every view.
    pub views: Vec<PairwiseView>,
    /// Every motion.
    pub motions: Vec<PairwiseMotion>,
    lookup: HashMap<String, ViewId>,
}

impl PairwiseImageGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a view, or return the existing one with the same id.
    pub fn create_node(&mut self, id: &str, total_observations: usize) -> ViewId {
        if let Some(&v) = self.lookup.get(id) {
            return v;
        }
        let v = self.views.len();
        self.views.push(PairwiseView {
            id: id.to_string(),
            total_observations,
            connections: Vec::new(),
        });
        self.lookup.insert(id.to_string(), v);
        v
    }

    /// Find a view by image id.
    pub fn lookup_view(&self, id: &str) -> Option<ViewId> {
        self.lookup.get(id).copied()
    }

    /// Add a motion and attach it to both endpoints.
    ///
    /// Returns `None` when both endpoints are the same view.
    pub fn connect(&mut self, motion: PairwiseMotion) -> Option<MotionId> {
        if motion.src == motion.dst
            || motion.src >= self.views.len()
            || motion.dst >= self.views.len()
        {
            return None;
        }
        let m = self.motions.len();
        self.views[motion.src].connections.push(m);
        self.views[motion.dst].connections.push(m);
        self.motions.push(motion);
        Some(m)
    }

    /// The motion connecting two views, if any.
    pub fn find_motion(&self, a: ViewId, b: ViewId) -> Option<MotionId> {
        self.views[a].connections.iter().copied().find(|&m| {
            let motion = &self.motions[m];
            (motion.src == a && motion.dst == b) || (motion.src == b && motion.dst == a)
        })
    }

    /// Whether every motion joins two distinct views and appears in exactly both connection lists.
    pub fn is_consistent(&self) -> bool {
        let edges_ok = self.motions.iter().enumerate().all(|(m, motion)| {
            motion.src != motion.dst
                && self.views[motion.src].connections.iter().filter(|&&c| c == m).count() == 1
                && self.views[motion.dst].connections.iter().filter(|&&c| c == m).count() == 1
        });
        let views_ok = self.views.iter().enumerate().all(|(v, view)| {
            view.connections
                .iter()
                .all(|&m| self.motions[m].src == v || self.motions[m].dst == v)
        });
        edges_ok && views_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn motion(src: ViewId, dst: ViewId) -> PairwiseMotion {
        PairwiseMotion {
            src,
            dst,
            is_3d: true,
            score_3d: 2.0,
            fundamental: Matrix3::zeros(),
            inliers: vec![AssociatedIndex::new(0, 1)],
            count_f: 40,
            count_h: 10,
        }
    }

    #[test]
    fn test_connect_and_find() {
        let mut graph = PairwiseImageGraph::new();
        let a = graph.create_node("a", 10);
        let b = graph.create_node("b", 12);
        let c = graph.create_node("c", 8);
        assert_eq!(graph.create_node("a", 99), a);

        let ab = graph.connect(motion(a, b)).expect("distinct views");
        let bc = graph.connect(motion(c, b)).expect("distinct views");
        assert!(graph.connect(motion(c, c)).is_none());

        assert_eq!(graph.find_motion(b, a), Some(ab));
        assert_eq!(graph.find_motion(b, c), Some(bc));
        assert_eq!(graph.find_motion(a, c), None);
        assert_eq!(graph.motions[bc].other(b), c);
        assert_eq!(graph.motions[bc].oriented(b, &AssociatedIndex::new(0, 1)), (1, 0));
        assert_eq!(graph.lookup_view("c"), Some(c));
        assert!(graph.is_consistent());
    }
}
