//! Outlier removal on a metric scene and its observations.

use std::collections::HashSet;

use crate::structure::{ObservationView, SceneObservations, SceneStructureMetric};

/// Removes observations, points, views and cameras from a metric scene while
/// keeping the scene and its observations consistent.
///
/// Point ids in the observations and view indices in the points are remapped
/// whenever points or views are removed.
pub struct PruneStructureFromScene<'a> {
    structure: &'a mut SceneStructureMetric,
    observations: &'a mut SceneObservations,
}

fn retain_observations(obs: &mut ObservationView, mut keep: impl FnMut(usize) -> bool) {
    let mut index = 0;
    obs.pixels.retain(|_| {
        let point = obs.points[index];
        index += 1;
        keep(point)
    });
    obs.points.retain(|&point| keep(point));
}

impl<'a> PruneStructureFromScene<'a> {
    /// Operate on a scene and the observations of its views.
    pub fn new(structure: &'a mut SceneStructureMetric, observations: &'a mut SceneObservations) -> Self {
        Self {
            structure,
            observations,
        }
    }

    fn observation_error(&self, view: usize, point: usize, pixel: &nalgebra::Vector2<f64>) -> f64 {
        if self.structure.depth(view, point) <= 0.0 {
            return f64::INFINITY;
        }
        self.structure
            .project(view, point)
            .map(|p| (p - pixel).norm_squared())
            .unwrap_or(f64::INFINITY)
    }

    fn remove_observations(&mut self, removed: &HashSet<(usize, usize)>) {
        if removed.is_empty() {
            return;
        }
        for (view, obs) in self.observations.views.iter_mut().enumerate() {
            retain_observations(obs, |point| !removed.contains(&(view, point)));
        }
        for (id, point) in self.structure.points.iter_mut().enumerate() {
            point.views.retain(|&view| !removed.contains(&(view, id)));
        }
    }

    /// Keep the `fraction` of observations with the lowest reprojection error.
    ///
    /// Observations behind their camera rank last. Returns the number removed.
    pub fn prune_observations_by_error_rank(&mut self, fraction: f64) -> usize {
        let mut errors = Vec::with_capacity(self.observations.total());
        for (view, obs) in self.observations.views.iter().enumerate() {
            for (&point, pixel) in obs.points.iter().zip(&obs.pixels) {
                errors.push((self.observation_error(view, point, pixel), view, point));
            }
        }
        let keep = ((errors.len() as f64) * fraction.clamp(0.0, 1.0)) as usize;
        errors.sort_by(|a, b| a.0.total_cmp(&b.0));

        let removed: HashSet<(usize, usize)> = errors[keep..].iter().map(|&(_, v, p)| (v, p)).collect();
        self.remove_observations(&removed);
        log::debug!(
            target: "kornia_sfm::prune",
            "error rank: kept {keep} removed {} observations",
            removed.len()
        );
        removed.len()
    }

    /// Remove observations of points that lie behind the observing camera.
    pub fn prune_observations_behind_camera(&mut self) -> usize {
        let mut removed = HashSet::new();
        for (view, obs) in self.observations.views.iter().enumerate() {
            for &point in &obs.points {
                if self.structure.depth(view, point) <= 0.0 {
                    removed.insert((view, point));
                }
            }
        }
        self.remove_observations(&removed);
        removed.len()
    }

    /// Remove points seen by fewer than `min_views` views. Returns the number removed.
    pub fn prune_points(&mut self, min_views: usize) -> usize {
        let n = self.structure.points.len();
        let mut remap = vec![None; n];
        let mut next = 0;
        for (id, point) in self.structure.points.iter().enumerate() {
            if point.views.len() >= min_views {
                remap[id] = Some(next);
                next += 1;
            }
        }
        if next == n {
            return 0;
        }

        let mut id = 0;
        self.structure.points.retain(|_| {
            let keep = remap[id].is_some();
            id += 1;
            keep
        });
        for obs in self.observations.views.iter_mut() {
            retain_observations(obs, |point| remap[point].is_some());
            for point in obs.points.iter_mut() {
                if let Some(new) = remap[*point] {
                    *point = new;
                }
            }
        }
        log::debug!(target: "kornia_sfm::prune", "removed {} points", n - next);
        n - next
    }

    /// Remove views observing fewer than `min_points` points.
    ///
    /// Returns whether any view was removed, so callers can iterate with
    /// [`Self::prune_points`] until nothing changes.
    pub fn prune_views(&mut self, min_points: usize) -> bool {
        let n = self.structure.views.len();
        let mut remap = vec![None; n];
        let mut next = 0;
        for (view, obs) in self.observations.views.iter().enumerate() {
            if obs.len() >= min_points {
                remap[view] = Some(next);
                next += 1;
            }
        }
        if next == n {
            return false;
        }

        let mut view = 0;
        self.structure.views.retain(|_| {
            let keep = remap[view].is_some();
            view += 1;
            keep
        });
        let mut view = 0;
        self.observations.views.retain(|_| {
            let keep = remap[view].is_some();
            view += 1;
            keep
        });
        for point in self.structure.points.iter_mut() {
            point.views = point.views.iter().filter_map(|&v| remap[v]).collect();
        }
        log::debug!(target: "kornia_sfm::prune", "removed {} views", n - next);
        true
    }

    /// Remove cameras no view references.
    pub fn prune_unused_cameras(&mut self) -> usize {
        let used: HashSet<usize> = self.structure.views.iter().filter_map(|v| v.camera).collect();
        let n = self.structure.cameras.len();
        let mut remap = vec![None; n];
        let mut next = 0;
        for (camera, slot) in remap.iter_mut().enumerate() {
            if used.contains(&camera) {
                *slot = Some(next);
                next += 1;
            }
        }
        let mut camera = 0;
        self.structure.cameras.retain(|_| {
            let keep = remap[camera].is_some();
            camera += 1;
            keep
        });
        for view in self.structure.views.iter_mut() {
            view.camera = view.camera.and_then(|c| remap[c]);
        }
        n - next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::{BundleCamera, PinholeCamera};
    use crate::structure::SceneCamera;
    use crate::synthetic;
    use nalgebra::Vector2;

    fn scene() -> (SceneStructureMetric, SceneObservations) {
        let scene = synthetic::orbit_scene(3, 12, 41);
        let camera = BundleCamera::Pinhole(PinholeCamera::from_focal(synthetic::FOCAL));
        synthetic::metric_structure(&scene, camera, true)
    }

    fn is_consistent(structure: &SceneStructureMetric, observations: &SceneObservations) -> bool {
        let mut from_points = HashSet::new();
        for (id, point) in structure.points.iter().enumerate() {
            for &v in &point.views {
                from_points.insert((v, id));
            }
        }
        let mut from_views = HashSet::new();
        for (v, obs) in observations.views.iter().enumerate() {
            if obs.points.len() != obs.pixels.len() {
                return false;
            }
            for &p in &obs.points {
                if p >= structure.points.len() {
                    return false;
                }
                from_views.insert((v, p));
            }
        }
        structure.views.len() == observations.views.len() && from_points == from_views
    }

    #[test]
    fn test_error_rank_keep_all_is_noop() {
        let (mut structure, mut observations) = scene();
        observations.views[1].pixels[4] += Vector2::new(30.0, 0.0);
        let (s0, o0) = (structure.clone(), observations.clone());
        let removed = PruneStructureFromScene::new(&mut structure, &mut observations).prune_observations_by_error_rank(1.0);
        assert_eq!(removed, 0);
        assert_eq!(structure, s0);
        assert_eq!(observations, o0);
    }

    #[test]
    fn test_error_rank_removes_worst() {
        let (mut structure, mut observations) = scene();
        let bad_point = observations.views[1].points[4];
        observations.views[1].pixels[4] += Vector2::new(30.0, 0.0);
        let total = observations.total();
        let removed = PruneStructureFromScene::new(&mut structure, &mut observations)
            .prune_observations_by_error_rank(1.0 - 0.5 / total as f64);
        assert_eq!(removed, 1);
        assert_eq!(observations.views[1].index_of_point(bad_point), None);
        assert!(!structure.points[bad_point].views.contains(&1));
        assert!(is_consistent(&structure, &observations));
    }

    #[test]
    fn test_prune_single_view_point() {
        let (mut structure, mut observations) = scene();
        let lonely = structure.add_point(nalgebra::Vector3::new(0.1, 0.2, 0.3));
        structure.connect_point_to_view(lonely, 2);
        let pixel = structure.project(2, lonely).expect("in front of the camera");
        observations.views[2].add(lonely, pixel);
        let before = observations.views[2].len();

        let removed = PruneStructureFromScene::new(&mut structure, &mut observations).prune_points(2);
        assert_eq!(removed, 1);
        assert_eq!(structure.points.len(), 12);
        assert_eq!(observations.views[2].len(), before - 1);
        assert!(is_consistent(&structure, &observations));
    }

    #[test]
    fn test_prune_points_remaps_ids() {
        let (mut structure, mut observations) = scene();
        // leave point 3 with a single view
        for v in [0, 1] {
            let index = observations.views[v].index_of_point(3).expect("observed");
            observations.views[v].remove(index);
        }
        structure.points[3].views = vec![2];
        let last = structure.points[11].coordinate;

        PruneStructureFromScene::new(&mut structure, &mut observations).prune_points(2);
        assert_eq!(structure.points.len(), 11);
        assert_eq!(structure.points[10].coordinate, last);
        assert!(observations.views[2].index_of_point(11).is_none());
        assert!(is_consistent(&structure, &observations));
    }

    #[test]
    fn test_prune_views_fixed_point() {
        let (mut structure, mut observations) = scene();
        observations.views[1] = ObservationView::default();
        for point in structure.points.iter_mut() {
            point.views.retain(|&v| v != 1);
        }

        let mut prune = PruneStructureFromScene::new(&mut structure, &mut observations);
        assert!(prune.prune_views(5));
        assert!(!prune.prune_views(5));
        assert_eq!(structure.views.len(), 2);
        assert_eq!(structure.views[1].id, synthetic::view_id(2));
        assert!(structure.points.iter().all(|p| p.views == vec![0, 1]));
        assert!(is_consistent(&structure, &observations));
    }

    #[test]
    fn test_behind_camera_and_unused_cameras() {
        let (mut structure, mut observations) = scene();
        structure.points[0].coordinate = nalgebra::Vector3::new(0.0, 0.0, -20.0);
        structure.cameras.push(SceneCamera {
            known: true,
            model: BundleCamera::Pinhole(PinholeCamera::from_focal(100.0)),
        });
        structure.cameras.swap(0, 1);
        for view in structure.views.iter_mut() {
            view.camera = Some(1);
        }

        let mut prune = PruneStructureFromScene::new(&mut structure, &mut observations);
        assert!(prune.prune_observations_behind_camera() > 0);
        assert_eq!(prune.prune_unused_cameras(), 1);
        assert_eq!(structure.cameras.len(), 1);
        assert!(structure.views.iter().all(|v| v.camera == Some(0)));
        assert!(is_consistent(&structure, &observations));
    }
}
