use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};

use crate::cancel::CancelToken;
use crate::config::ConfigExpand;
use crate::error::SfmError;
use crate::geometry::essential::{essential_from_fundamental, select_essential_pose};
use crate::geometry::linalg::median;
use crate::geometry::pnp::{solve_pnp_ransac, Point2D3D};
use crate::geometry::se3::Se3;
use crate::geometry::triangulate::{
    reprojection_error_two_view, triangulate_metric, triangulate_two_view, triangulation_angle,
};
use crate::geometry::AssociatedPair;
use crate::graph::pairwise::{MotionId, ViewId};
use crate::graph::working::{SceneWorkingGraph, StereoPoint, ViewState, WorkingView};
use crate::pipeline::merge::add_triangulated_features_for_all_edges;

/// Grows a seeded working graph one view at a time.
///
/// The open view with the most observations of known features is placed next
/// by robust PnP. Once placed, the edge triangulations of its motions are merged
/// and its matches to other placed views are triangulated.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpandScene {
    /// Configuration.
    pub config: ConfigExpand,
}

impl ExpandScene {
    /// Create the growth engine.
    pub fn new(config: ConfigExpand) -> Self {
        Self { config }
    }

    /// Estimate the relative pose of every motion not already inside the placed
    /// set, and triangulate those with enough parallax.
    pub fn prepare_edges(&self, graph: &mut SceneWorkingGraph, cancel: &CancelToken) -> Result<(), SfmError> {
        for m in 0..graph.motions.len() {
            let motion = &graph.motions[m];
            let placed = |v: ViewId| graph.views[v].state() == ViewState::Processed;
            if motion.detached || (placed(motion.src) && placed(motion.dst)) {
                continue;
            }
            cancel.check()?;
            self.prepare_edge(graph, m);
        }
        Ok(())
    }

    /// Relative pose from the essential matrix, median parallax and, when the
    /// parallax is large enough, triangulations at unit baseline.
    pub fn prepare_edge(&self, graph: &mut SceneWorkingGraph, motion: MotionId) {
        let m = &graph.motions[motion];
        let (src, dst) = (&graph.views[m.src], &graph.views[m.dst]);
        let e = essential_from_fundamental(&m.fundamental, &src.intrinsics.k_matrix(), &dst.intrinsics.k_matrix());
        let pairs: Vec<AssociatedPair> = m
            .inliers
            .iter()
            .map(|i| AssociatedPair::new(src.norm[i.src], dst.norm[i.dst]))
            .collect();
        let (a_to_b, _) = select_essential_pose(&e, &pairs);

        let mut angles: Vec<f64> = pairs
            .iter()
            .map(|p| triangulation_angle(&p.p1, &p.p2, &a_to_b))
            .collect();
        let median_angle = median(&mut angles).unwrap_or(0.0);

        let mut stereo = Vec::new();
        if median_angle > self.config.stereo_min_median_angle {
            let max_error = self.config.max_pixel_error * self.config.max_pixel_error;
            for (inlier, pair) in m.inliers.iter().zip(&pairs) {
                let angle = triangulation_angle(&pair.p1, &pair.p2, &a_to_b);
                if angle < self.config.triangulate_min_angle {
                    continue;
                }
                let Some(local) = triangulate_two_view(&pair.p1, &pair.p2, &a_to_b) else {
                    continue;
                };
                if local.z <= 0.0 || a_to_b.transform(&local).z <= 0.0 {
                    continue;
                }
                let error = reprojection_error_two_view(
                    &src.intrinsics,
                    &dst.intrinsics,
                    &src.pixels[inlier.src],
                    &dst.pixels[inlier.dst],
                    &a_to_b,
                    &local,
                );
                if error <= max_error {
                    stereo.push(StereoPoint {
                        local,
                        src_obs: inlier.src,
                        dst_obs: inlier.dst,
                        triangulation_angle: angle,
                    });
                }
            }
        }
        log::debug!(
            target: "kornia_sfm::expand",
            "edge {} {}-{}: median angle {:.3}, {} stereo points",
            motion,
            src.id,
            dst.id,
            median_angle,
            stereo.len()
        );

        let m = &mut graph.motions[motion];
        m.a_to_b = a_to_b;
        m.triangulation_angle = median_angle;
        m.stereo = stereo;
    }

    /// Place `target` by robust PnP against the features its observations already map to.
    ///
    /// Returns the number of inliers. On success the view is processed and every
    /// inlier feature is attached to it.
    pub fn determine_pose(&self, graph: &mut SceneWorkingGraph, target: ViewId) -> Result<usize, SfmError> {
        let view = &graph.views[target];
        let mut seen = HashSet::new();
        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for (obs, slot) in view.features3d.iter().enumerate() {
            if let Some(f) = slot {
                seen.insert(obs);
                candidates.push((obs, *f));
            }
        }
        for &m in &view.connections {
            let motion = &graph.motions[m];
            let other = &graph.views[motion.other(target)];
            if other.state() != ViewState::Processed {
                continue;
            }
            for inlier in &motion.inliers {
                let (obs, obs_other) = motion.oriented(target, inlier);
                if let Some(f) = other.features3d[obs_other] {
                    if seen.insert(obs) {
                        candidates.push((obs, f));
                    }
                }
            }
        }

        if candidates.len() < self.config.min_pnp_candidates {
            return Err(SfmError::PoseEstimationFailed(format!(
                "view {} has {} candidates, {} required",
                view.id,
                candidates.len(),
                self.config.min_pnp_candidates
            )));
        }
        let points: Vec<Point2D3D> = candidates
            .iter()
            .map(|&(obs, f)| Point2D3D::new(view.norm[obs], graph.features[f].world))
            .collect();
        let result = solve_pnp_ransac(&points, &self.config.ransac_pnp, view.intrinsics.mean_focal())
            .map_err(|e| SfmError::PoseEstimationFailed(format!("view {}: {e}", view.id)))?;

        graph.views[target].view_to_world = result.world_to_view.inverse();
        graph.set_state(target, ViewState::Processed);
        for &i in &result.inliers {
            let (obs, f) = candidates[i];
            graph.attach(f, target, obs);
        }
        log::debug!(
            target: "kornia_sfm::expand",
            "view {}: {} of {} pnp inliers",
            graph.views[target].id,
            result.inliers.len(),
            candidates.len()
        );
        Ok(result.inliers.len())
    }

    /// Triangulate one observation in each of two placed views, or `None` when the
    /// parallax is too small, the point is behind either view or does not reproject.
    pub fn triangulate_pair(
        &self,
        graph: &SceneWorkingGraph,
        a: (ViewId, usize),
        b: (ViewId, usize),
    ) -> Option<(Vector3<f64>, f64)> {
        let (va, vb) = (&graph.views[a.0], &graph.views[b.0]);
        let (pose_a, pose_b) = (va.view_to_world.inverse(), vb.view_to_world.inverse());
        let (norm_a, norm_b) = (va.norm[a.1], vb.norm[b.1]);

        let a_to_b = pose_a.inverse().then(&pose_b);
        let angle = triangulation_angle(&norm_a, &norm_b, &a_to_b);
        if angle < self.config.triangulate_min_angle {
            return None;
        }
        let world = triangulate_metric(&[norm_a, norm_b], &[pose_a, pose_b])?;
        let max_error = self.config.max_pixel_error * self.config.max_pixel_error;
        let fits = |pose: &Se3, view: &WorkingView, pixel: &Vector2<f64>| {
            let x = pose.transform(&world);
            x.z > 0.0
                && view
                    .intrinsics
                    .project(&x)
                    .is_some_and(|p| (p - pixel).norm_squared() <= max_error)
        };
        (fits(&pose_a, va, &va.pixels[a.1]) && fits(&pose_b, vb, &vb.pixels[b.1])).then_some((world, angle))
    }

    /// Triangulate the matches of `target` to placed views that have no feature yet.
    ///
    /// Matches whose counterpart already has a feature are attached instead.
    /// Returns the number of features created.
    pub fn triangulate_no_location(&self, graph: &mut SceneWorkingGraph, target: ViewId) -> usize {
        let mut created = 0;
        let connections = graph.views[target].connections.clone();
        for m in connections {
            let other = graph.motions[m].other(target);
            if graph.views[other].state() != ViewState::Processed {
                continue;
            }
            for k in 0..graph.motions[m].inliers.len() {
                let inlier = graph.motions[m].inliers[k];
                let (obs, obs_other) = graph.motions[m].oriented(target, &inlier);
                match (graph.views[target].features3d[obs], graph.views[other].features3d[obs_other]) {
                    (Some(_), _) => {}
                    (None, Some(f)) => {
                        graph.attach(f, target, obs);
                    }
                    (None, None) => {
                        if let Some((world, angle)) = self.triangulate_pair(graph, (target, obs), (other, obs_other)) {
                            graph.add_feature(world, angle, &[(target, obs), (other, obs_other)]);
                            created += 1;
                        }
                    }
                }
            }
        }
        log::debug!(
            target: "kornia_sfm::expand",
            "view {}: triangulated {created} new features",
            graph.views[target].id
        );
        created
    }

    fn open_neighbors(graph: &mut SceneWorkingGraph, view: ViewId, open: &mut Vec<ViewId>) {
        for i in 0..graph.views[view].connections.len() {
            let other = graph.motions[graph.views[view].connections[i]].other(view);
            if graph.views[other].state() == ViewState::Unprocessed {
                graph.set_state(other, ViewState::Pending);
                open.push(other);
            }
        }
    }

    /// Place every view reachable from the processed ones.
    ///
    /// Views whose pose cannot be determined are detached from the graph and
    /// returned; they stay unplaced.
    pub fn expand(&self, graph: &mut SceneWorkingGraph, cancel: &CancelToken) -> Result<Vec<ViewId>, SfmError> {
        let mut open = Vec::new();
        for v in graph.views_in_state(ViewState::Processed) {
            Self::open_neighbors(graph, v, &mut open);
        }

        let mut removed = Vec::new();
        while !open.is_empty() {
            cancel.check()?;
            let (best, _) = open
                .iter()
                .enumerate()
                .map(|(i, &v)| (i, graph.count_features_with_3d(v)))
                .max_by_key(|&(i, count)| (count, std::cmp::Reverse(i)))
                .unwrap_or((0, 0));
            let view = open.swap_remove(best);

            match self.determine_pose(graph, view) {
                Ok(_) => {
                    add_triangulated_features_for_all_edges(graph, view, self.config.min_scale_overlap);
                    self.triangulate_no_location(graph, view);
                    Self::open_neighbors(graph, view, &mut open);
                }
                Err(e) => {
                    log::warn!(target: "kornia_sfm::expand", "removing view {}: {e}", graph.views[view].id);
                    graph.detach_view(view);
                    removed.push(view);
                }
            }
        }
        log::info!(
            target: "kornia_sfm::expand",
            "{} views placed, {} removed, {} features",
            graph.views_in_state(ViewState::Processed).len(),
            removed.len(),
            graph.features.len()
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn seeded(scene: &synthetic::SyntheticScene, placed: &[ViewId]) -> (SceneWorkingGraph, Vec<Vec<usize>>) {
        let (mut graph, point_to_feature) = scene.working_graph(81);
        for &v in placed {
            graph.set_state(v, ViewState::Processed);
            graph.views[v].view_to_world = scene.poses[v].inverse();
        }
        for (p, x) in scene.points.iter().enumerate() {
            let obs: Vec<(ViewId, usize)> = placed.iter().map(|&v| (v, point_to_feature[v][p])).collect();
            graph.add_feature(*x, 0.3, &obs);
        }
        (graph, point_to_feature)
    }

    #[test]
    fn test_prepare_edge_recovers_direction() {
        let scene = synthetic::orbit_scene(2, 50, 82);
        let (mut graph, _) = scene.working_graph(83);
        let expand = ExpandScene::default();
        expand.prepare_edge(&mut graph, 0);

        let truth = scene.poses[0].inverse().then(&scene.poses[1]);
        let motion = &graph.motions[0];
        assert_relative_eq!(motion.a_to_b.rotation, truth.rotation, epsilon = 1e-6);
        assert_relative_eq!(motion.a_to_b.translation, truth.translation.normalize(), epsilon = 1e-6);
        // 30 degrees apart, well above the stereo gate
        assert!(motion.triangulation_angle > PI / 10.0);
        assert_eq!(motion.stereo.len(), 50);
    }

    #[test]
    fn test_small_parallax_is_rejected() {
        let points = synthetic::random_points(20, 84);
        let poses = vec![
            synthetic::look_at(Vector3::new(0.0, 0.0, -6.0), Vector3::zeros(), 0.0),
            synthetic::look_at(Vector3::new(0.3, 0.0, -6.0), Vector3::zeros(), 0.0),
            synthetic::look_at(Vector3::new(3.0, 0.0, -6.0), Vector3::zeros(), 0.0),
        ];
        let scene = synthetic::SyntheticScene::new(points, poses);
        let (mut graph, point_to_feature) = scene.working_graph(85);
        for v in 0..3 {
            graph.set_state(v, ViewState::Processed);
            graph.views[v].view_to_world = scene.poses[v].inverse();
        }
        let expand = ExpandScene::default();
        for p in 0..20 {
            let obs = |v: usize| (v, point_to_feature[v][p]);
            // zero pixel error, but the rays are almost parallel
            assert!(expand.triangulate_pair(&graph, obs(0), obs(1)).is_none());
            let (world, angle) = expand.triangulate_pair(&graph, obs(0), obs(2)).expect("wide baseline");
            assert!(angle >= PI / 20.0);
            assert_relative_eq!(world, scene.points[p], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_determine_pose() -> Result<(), SfmError> {
        let scene = synthetic::orbit_scene(3, 40, 86);
        let (mut graph, point_to_feature) = seeded(&scene, &[0, 1]);
        let inliers = ExpandScene::default().determine_pose(&mut graph, 2)?;
        assert_eq!(inliers, 40);
        assert_eq!(graph.views[2].state(), ViewState::Processed);
        let pose = graph.views[2].view_to_world.inverse();
        assert_relative_eq!(pose.rotation, scene.poses[2].rotation, epsilon = 1e-6);
        assert_relative_eq!(pose.translation, scene.poses[2].translation, epsilon = 1e-6);
        assert_eq!(graph.views[2].features3d[point_to_feature[2][7]], Some(7));
        assert!(graph.is_consistent());
        Ok(())
    }

    #[test]
    fn test_determine_pose_needs_candidates() {
        let scene = synthetic::orbit_scene(3, 15, 87);
        let (mut graph, _) = seeded(&scene, &[0, 1]);
        let result = ExpandScene::default().determine_pose(&mut graph, 2);
        assert!(matches!(result, Err(SfmError::PoseEstimationFailed(_))));
        assert_eq!(graph.views[2].state(), ViewState::Unprocessed);
    }

    #[test]
    fn test_expand_places_every_view() -> Result<(), SfmError> {
        let scene = synthetic::orbit_scene(5, 60, 88);
        let (mut graph, _) = seeded(&scene, &[0, 1]);
        let expand = ExpandScene::default();
        let cancel = CancelToken::new();
        expand.prepare_edges(&mut graph, &cancel)?;
        let removed = expand.expand(&mut graph, &cancel)?;

        assert!(removed.is_empty());
        assert_eq!(graph.views_in_state(ViewState::Processed).len(), 5);
        for (v, truth) in scene.poses.iter().enumerate() {
            let pose = graph.views[v].view_to_world.inverse();
            assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-5);
        }
        assert!(graph.features.iter().all(|f| f.views.len() == 5));
        assert!(graph.is_consistent());
        Ok(())
    }

    #[test]
    fn test_expand_removes_unplaceable_view() -> Result<(), SfmError> {
        let scene = synthetic::orbit_scene(4, 30, 89);
        let (mut graph, _) = seeded(&scene, &[0, 1]);
        let expand = ExpandScene::new(ConfigExpand {
            min_pnp_candidates: 31,
            ..Default::default()
        });
        let removed = expand.expand(&mut graph, &CancelToken::new())?;
        removed.iter().for_each(|&v| assert!(graph.views[v].connections.is_empty()));
        assert_eq!(removed.len(), 2);
        assert!(graph.views[2].state() != ViewState::Processed);
        assert!(graph.is_consistent());
        Ok(())
    }

    #[test]
    fn test_expand_is_cancellable() {
        let scene = synthetic::orbit_scene(3, 30, 90);
        let (mut graph, _) = seeded(&scene, &[0, 1]);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            ExpandScene::default().expand(&mut graph, &cancel),
            Err(SfmError::Cancelled)
        ));
    }
}
