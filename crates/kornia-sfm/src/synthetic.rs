//! Synthetic scenes shared by unit tests.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Rotation3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::geometry::camera::{BundleCamera, PinholeCamera};
use crate::geometry::se3::Se3;
use crate::geometry::linalg::skew;
use crate::graph::pairwise::{PairwiseImageGraph, PairwiseMotion};
use crate::graph::working::SceneWorkingGraph;
use crate::lookup::{AssociatedIndex, ImageShape, SimilarImagesDb};
use crate::structure::{SceneCamera, SceneObservations, SceneStructureMetric, SceneView};

pub const FOCAL: f64 = 500.0;
pub const SHAPE: ImageShape = ImageShape {
    width: 800,
    height: 600,
};

pub fn k_matrix(f: f64) -> Matrix3<f64> {
    Matrix3::new(f, 0.0, 0.0, 0.0, f, 0.0, 0.0, 0.0, 1.0)
}

pub fn project(k: &Matrix3<f64>, p: &Vector3<f64>) -> Vector2<f64> {
    let h = k * p;
    Vector2::new(h.x / h.z, h.y / h.z)
}

pub fn random_points(n: usize, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Vector3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
            )
        })
        .collect()
}

/// World to view transform of a camera at `center` looking at `target`.
pub fn look_at(center: Vector3<f64>, target: Vector3<f64>, roll: f64) -> Se3 {
    let z = (target - center).normalize();
    let x = Vector3::y().cross(&z).normalize();
    let y = z.cross(&x);
    let r = Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()]);
    let r = Rotation3::from_axis_angle(&Vector3::z_axis(), roll).into_inner() * r;
    Se3::new(r, -(r * center))
}

pub struct SyntheticScene {
    pub points: Vec<Vector3<f64>>,
    pub poses: Vec<Se3>,
    /// centered pixels, `pixels[view][point]`
    pub pixels: Vec<Vec<Vector2<f64>>>,
    pub k: Matrix3<f64>,
}

impl SyntheticScene {
    pub fn new(points: Vec<Vector3<f64>>, poses: Vec<Se3>) -> Self {
        let k = k_matrix(FOCAL);
        let pixels = poses
            .iter()
            .map(|pose| points.iter().map(|p| project(&k, &pose.transform(p))).collect())
            .collect();
        Self {
            points,
            poses,
            pixels,
            k,
        }
    }

    /// Camera matrices in the projective frame where the first one is `[I | 0]`.
    pub fn projective_cameras(&self) -> Vec<Matrix3x4<f64>> {
        let metric: Vec<Matrix3x4<f64>> = self.poses.iter().map(|p| self.k * p.to_matrix()).collect();
        let mut first = Matrix4::identity();
        first.fixed_view_mut::<3, 4>(0, 0).copy_from(&metric[0]);
        let h = first.try_inverse().expect("first camera is finite");
        metric.iter().map(|p| p * h).collect()
    }

    /// Database with shuffled feature order per view and every pair matched.
    pub fn database(&self, seed: u64) -> (SimilarImagesDb, Vec<Vec<usize>>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let center = SHAPE.center();
        let n = self.points.len();
        let mut db = SimilarImagesDb::new();
        // point_to_feature[view][point]
        let mut point_to_feature = Vec::new();
        for (v, pixels) in self.pixels.iter().enumerate() {
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);
            let mut inverse = vec![0; n];
            for (feature, &point) in order.iter().enumerate() {
                inverse[point] = feature;
            }
            let feats = order.iter().map(|&p| pixels[p] + center).collect();
            db.add_image(view_id(v), SHAPE, feats).expect("unique id");
            point_to_feature.push(inverse);
        }
        for a in 0..self.pixels.len() {
            for b in (a + 1)..self.pixels.len() {
                let matches = (0..n)
                    .map(|p| AssociatedIndex::new(point_to_feature[a][p], point_to_feature[b][p]))
                    .collect();
                db.add_matches(&view_id(a), &view_id(b), matches).expect("valid matches");
            }
        }
        (db, point_to_feature)
    }

    /// Fundamental matrix with `x_bᵀ F x_a = 0` for centered pixels.
    pub fn fundamental(&self, a: usize, b: usize) -> Matrix3<f64> {
        let a_to_b = self.poses[a].inverse().then(&self.poses[b]);
        let e = skew(&a_to_b.translation) * a_to_b.rotation;
        let k_inv = self.k.try_inverse().expect("invertible calibration");
        k_inv.transpose() * e * k_inv
    }

    /// Pairwise graph where every pair of views is a 3D motion matching every point.
    pub fn pairwise_graph(&self, point_to_feature: &[Vec<usize>]) -> PairwiseImageGraph {
        let n = self.points.len();
        let mut graph = PairwiseImageGraph::new();
        for v in 0..self.poses.len() {
            graph.create_node(&view_id(v), n);
        }
        for a in 0..self.poses.len() {
            for b in (a + 1)..self.poses.len() {
                graph.connect(PairwiseMotion {
                    src: a,
                    dst: b,
                    is_3d: true,
                    score_3d: 10.0,
                    fundamental: self.fundamental(a, b),
                    inliers: (0..n)
                        .map(|p| AssociatedIndex::new(point_to_feature[a][p], point_to_feature[b][p]))
                        .collect(),
                    count_f: n,
                    count_h: n / 10,
                });
            }
        }
        graph
    }

    /// Working graph with one known pinhole camera and nothing processed.
    pub fn working_graph(&self, seed: u64) -> (SceneWorkingGraph, Vec<Vec<usize>>) {
        let (db, point_to_feature) = self.database(seed);
        let pairwise = self.pairwise_graph(&point_to_feature);
        let camera = PinholeCamera::from_focal(FOCAL);
        let assignment = vec![(0, camera); self.poses.len()];
        let graph = SceneWorkingGraph::new(&pairwise, &db, vec![BundleCamera::Pinhole(camera)], &assignment)
            .expect("synthetic views are in the database");
        (graph, point_to_feature)
    }
}

pub fn view_id(v: usize) -> String {
    format!("view{v:02}")
}

/// Cameras on a horizontal circle, 30 degrees apart, looking at the origin.
pub fn orbit_scene(n_views: usize, n_points: usize, seed: u64) -> SyntheticScene {
    let poses = (0..n_views)
        .map(|i| {
            let theta = (i as f64 * 30.0).to_radians();
            let center = Vector3::new(6.0 * theta.sin(), 0.0, -6.0 * theta.cos());
            look_at(center, Vector3::zeros(), 0.0)
        })
        .collect();
    SyntheticScene::new(random_points(n_points, seed), poses)
}

/// Cameras with varying azimuth, elevation and roll, looking at different targets
/// so their optical axes do not meet in one point.
pub fn general_scene(n_views: usize, n_points: usize, seed: u64) -> SyntheticScene {
    let poses = (0..n_views)
        .map(|i| {
            let theta = (i as f64 * 35.0).to_radians();
            let phi = (((i % 3) as f64 - 1.0) * 25.0).to_radians();
            let center = Vector3::new(
                6.0 * theta.sin() * phi.cos(),
                6.0 * phi.sin(),
                -6.0 * theta.cos() * phi.cos(),
            );
            let t = i as f64;
            let target = Vector3::new(0.4 * (1.7 * t).sin(), 0.3 * (2.3 * t + 0.5).cos(), 0.4 * (0.9 * t).sin());
            look_at(center, target, (i as f64 * 12.0).to_radians())
        })
        .collect();
    SyntheticScene::new(random_points(n_points, seed), poses)
}

/// Metric structure of a scene with one shared camera; every view observes every point.
pub fn metric_structure(
    scene: &SyntheticScene,
    camera: BundleCamera,
    known_camera: bool,
) -> (SceneStructureMetric, SceneObservations) {
    let mut structure = SceneStructureMetric::new();
    structure.cameras.push(SceneCamera {
        known: known_camera,
        model: camera,
    });
    for (i, pose) in scene.poses.iter().enumerate() {
        structure.views.push(SceneView {
            id: view_id(i),
            known: i == 0,
            pose: *pose,
            camera: Some(0),
            width: SHAPE.width,
            height: SHAPE.height,
        });
    }
    let mut observations = SceneObservations::new(scene.poses.len());
    for (j, p) in scene.points.iter().enumerate() {
        let id = structure.add_point(*p);
        for (v, pixels) in scene.pixels.iter().enumerate() {
            structure.connect_point_to_view(id, v);
            observations.views[v].add(j, pixels[j]);
        }
    }
    (structure, observations)
}
