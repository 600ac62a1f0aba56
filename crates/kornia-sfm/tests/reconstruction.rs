use std::collections::HashMap;

use kornia_sfm::geometry::camera::{BundleCamera, PinholeCamera};
use kornia_sfm::geometry::se3::Se3;
use kornia_sfm::lookup::{AssociatedIndex, ImageShape, SimilarImagesDb};
use kornia_sfm::structure::{SceneObservations, SceneStructureMetric};
use kornia_sfm::{CameraPrior, CancelToken, ConfigSfm, LookupError, SfmError, SparseReconstruction};
use nalgebra::{Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const FOCAL: f64 = 480.0;
const SHAPE: ImageShape = ImageShape {
    width: 640,
    height: 480,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn image_id(v: usize) -> String {
    format!("img{v:03}")
}

/// World to view transform of a camera at `center` looking at `target`.
fn look_at(center: Vector3<f64>, target: Vector3<f64>, roll: f64) -> Se3 {
    let z = (target - center).normalize();
    let x = Vector3::y().cross(&z).normalize();
    let y = z.cross(&x);
    let (s, c) = roll.sin_cos();
    let r = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
        * Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()]);
    Se3::new(r, -(r * center))
}

struct Scene {
    poses: Vec<Se3>,
    db: SimilarImagesDb,
}

/// Every view sees every point; features are stored in point order.
fn build_scene(poses: Vec<Se3>, n_points: usize, seed: u64) -> Scene {
    let mut rng = StdRng::seed_from_u64(seed);
    let points: Vec<Vector3<f64>> = (0..n_points)
        .map(|_| {
            Vector3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
            )
        })
        .collect();

    let camera = PinholeCamera::new(FOCAL, FOCAL, 0.0, 320.0, 240.0);
    let mut db = SimilarImagesDb::new();
    for (v, pose) in poses.iter().enumerate() {
        let pixels: Vec<Vector2<f64>> = points
            .iter()
            .filter_map(|p| camera.project(&pose.transform(p)))
            .collect();
        assert_eq!(pixels.len(), n_points);
        db.add_image(image_id(v), SHAPE, pixels).expect("unique image id");
    }
    for a in 0..poses.len() {
        for b in (a + 1)..poses.len() {
            let matches = (0..n_points).map(|i| AssociatedIndex::new(i, i)).collect();
            db.add_matches(&image_id(a), &image_id(b), matches).expect("valid matches");
        }
    }
    Scene { poses, db }
}

fn orbit(n_views: usize) -> Vec<Se3> {
    (0..n_views)
        .map(|i| {
            let theta = (i as f64 * 30.0).to_radians();
            look_at(Vector3::new(6.0 * theta.sin(), 0.0, -6.0 * theta.cos()), Vector3::zeros(), 0.0)
        })
        .collect()
}

fn general(n_views: usize) -> Vec<Se3> {
    (0..n_views)
        .map(|i| {
            let theta = (i as f64 * 35.0).to_radians();
            let phi = (((i % 3) as f64 - 1.0) * 20.0).to_radians();
            let center = Vector3::new(
                6.0 * theta.sin() * phi.cos(),
                6.0 * phi.sin(),
                -6.0 * theta.cos() * phi.cos(),
            );
            // optical axes must not share a point or the focal length is ambiguous
            let t = i as f64;
            let target = Vector3::new(0.4 * (1.7 * t).sin(), 0.3 * (2.3 * t + 0.5).cos(), 0.4 * (0.9 * t).sin());
            look_at(center, target, (i as f64 * 10.0).to_radians())
        })
        .collect()
}

fn mean_reprojection_error(structure: &SceneStructureMetric, observations: &SceneObservations) -> f64 {
    let mut sum = 0.0;
    let mut count = 0;
    for (v, obs) in observations.views.iter().enumerate() {
        for (&p, pixel) in obs.points.iter().zip(&obs.pixels) {
            let predicted = structure.project(v, p).expect("point in front of the camera");
            sum += (predicted - pixel).norm();
            count += 1;
        }
    }
    sum / count as f64
}

/// Distances between camera centers match the truth up to one global scale.
fn assert_layout_matches(truth: &[Se3], structure: &SceneStructureMetric, max_relative: f64) {
    let center = |pose: &Se3| pose.inverse().translation;
    let by_id: HashMap<&str, Vector3<f64>> = structure
        .views
        .iter()
        .map(|v| (v.id.as_str(), center(&v.pose)))
        .collect();
    let truth: Vec<Vector3<f64>> = truth.iter().map(center).collect();
    let found: Vec<Vector3<f64>> = (0..truth.len()).map(|v| by_id[image_id(v).as_str()]).collect();
    let scale = (found[1] - found[0]).norm() / (truth[1] - truth[0]).norm();
    for a in 0..truth.len() {
        for b in (a + 1)..truth.len() {
            let expected = (truth[b] - truth[a]).norm() * scale;
            approx::assert_relative_eq!((found[b] - found[a]).norm(), expected, max_relative = max_relative);
        }
    }
}

fn assert_observations_consistent(structure: &SceneStructureMetric, observations: &SceneObservations) {
    assert_eq!(structure.views.len(), observations.views.len());
    for (p, point) in structure.points.iter().enumerate() {
        assert!(point.views.len() >= 2);
        for &v in &point.views {
            assert!(observations.views[v].index_of_point(p).is_some());
        }
    }
}

#[test]
fn test_calibrated_orbit() -> Result<(), SfmError> {
    init_logger();
    let scene = build_scene(orbit(5), 200, 1);
    let mut config = ConfigSfm::calibrated();
    config.init.max_seed_connections = 2;
    config.init.ransac_trifocal.random_seed = Some(3);
    config.expand.ransac_pnp.random_seed = Some(4);

    let prior = CameraPrior::Calibrated {
        cameras: vec![PinholeCamera::new(FOCAL, FOCAL, 0.0, 320.0, 240.0)],
        view_to_camera: (0..5).map(|v| (image_id(v), 0)).collect(),
    };
    let mut sfm = SparseReconstruction::new(config);
    let result = sfm.process(&scene.db, &prior, &CancelToken::new())?;

    assert_eq!(result.structure.views.len(), 5);
    assert!(result.removed_views.is_empty());
    assert!(result.structure.points.len() >= 150);
    assert!(result.structure.cameras.iter().all(|c| c.known));
    assert_observations_consistent(&result.structure, &result.observations);
    assert!(mean_reprojection_error(&result.structure, &result.observations) < 0.5);
    assert_layout_matches(&scene.poses, &result.structure, 1e-2);
    Ok(())
}

#[test]
fn test_uncalibrated_general() -> Result<(), SfmError> {
    init_logger();
    let scene = build_scene(general(6), 250, 2);
    let mut config = ConfigSfm::uncalibrated();
    config.init.ransac_trifocal.random_seed = Some(5);
    config.expand.ransac_pnp.random_seed = Some(6);

    let mut sfm = SparseReconstruction::new(config);
    let result = sfm.process(&scene.db, &CameraPrior::Uncalibrated, &CancelToken::new())?;

    assert_eq!(result.structure.views.len(), 6);
    assert!(result.removed_views.is_empty());
    assert!(result.structure.points.len() >= 200);
    assert_eq!(result.structure.cameras.len(), 1);
    assert!(!result.structure.cameras[0].known);
    match &result.structure.cameras[0].model {
        BundleCamera::Simplified(camera) => {
            approx::assert_relative_eq!(camera.f, FOCAL, max_relative = 5e-2)
        }
        other => panic!("expected a simplified camera, got {other:?}"),
    }
    assert_observations_consistent(&result.structure, &result.observations);
    assert!(mean_reprojection_error(&result.structure, &result.observations) < 1.0);
    assert_layout_matches(&scene.poses, &result.structure, 2e-2);
    Ok(())
}

#[test]
fn test_single_pair_has_no_seed() {
    init_logger();
    let scene = build_scene(orbit(2), 100, 3);
    let mut sfm = SparseReconstruction::new(ConfigSfm::calibrated());
    let result = sfm.process(&scene.db, &CameraPrior::Uncalibrated, &CancelToken::new());
    assert!(matches!(result, Err(SfmError::NoSeedView)));
}

#[test]
fn test_missing_calibration() {
    init_logger();
    let scene = build_scene(orbit(3), 100, 4);
    let prior = CameraPrior::Calibrated {
        cameras: vec![PinholeCamera::new(FOCAL, FOCAL, 0.0, 320.0, 240.0)],
        view_to_camera: [(image_id(0), 0), (image_id(1), 0)].into_iter().collect(),
    };
    let mut sfm = SparseReconstruction::new(ConfigSfm::calibrated());
    let result = sfm.process(&scene.db, &prior, &CancelToken::new());
    assert!(matches!(
        result,
        Err(SfmError::Lookup(LookupError::UnknownImage(id))) if id == image_id(2)
    ));
}

#[test]
fn test_cancelled() {
    init_logger();
    let scene = build_scene(orbit(4), 100, 5);
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut sfm = SparseReconstruction::new(ConfigSfm::calibrated());
    let result = sfm.process(&scene.db, &CameraPrior::Uncalibrated, &cancel);
    assert!(matches!(result, Err(SfmError::Cancelled)));
}
