//! Elevation of a projective cluster to metric space and refinement of metric scenes.

use nalgebra::{Matrix3, Matrix4, Vector2, Vector3};

use crate::bundle::{BundleAdjustment, BundleSummary};
use crate::config::{ConfigConverge, ConfigMetric};
use crate::error::{GeometryError, SfmError};
use crate::geometry::camera::{decompose_camera_matrix, BundleCamera, BundlePinholeSimplified, PinholeCamera};
use crate::geometry::se3::Se3;
use crate::geometry::selfcalib::{
    absolute_quadratic_to_h, plane_at_infinity_given_k, projective_to_metric_h, SelfCalibrationLinearDualQuadratic,
};
use crate::geometry::triangulate::triangulate_metric;
use crate::pipeline::initialize::ProjectiveInitialization;
use crate::prune::PruneStructureFromScene;
use crate::structure::{SceneCamera, SceneObservations, SceneStructureMetric, SceneView};

/// How the intrinsics of an initialized cluster are obtained.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClusterIntrinsics<'a> {
    /// Known intrinsics of every cluster view, for centered pixels.
    Known(&'a [PinholeCamera]),
    /// Estimated by self-calibration, or from a manual or fallback focal length.
    Unknown,
}

/// Projective to metric upgrade of a cluster.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricUpgrade {
    /// Maps metric points to projective ones: `X_p = H X_m`, `P_m = P_p H`.
    pub h: Matrix4<f64>,
    /// Mean focal length of the cluster views, in pixels.
    pub focal: f64,
    /// Whether the upgrade came from self-calibration.
    pub self_calibrated: bool,
}

/// Metric poses of the cluster cameras under `h`, with the sign fixed by decomposition.
fn metric_poses(init: &ProjectiveInitialization, h: &Matrix4<f64>) -> Result<Vec<(Matrix3<f64>, Se3)>, GeometryError> {
    init.structure
        .views
        .iter()
        .map(|v| decompose_camera_matrix(&(v.pose * h)))
        .collect()
}

/// Number of point observations in front of their camera under `h`.
fn count_in_front(init: &ProjectiveInitialization, h: &Matrix4<f64>) -> usize {
    let (Some(h_inv), Ok(poses)) = (h.try_inverse(), metric_poses(init, h)) else {
        return 0;
    };
    let mut count = 0;
    for point in &init.structure.points {
        let x = h_inv * point.coordinate;
        if x.w.abs() < 1e-12 {
            continue;
        }
        let x = x.xyz() / x.w;
        count += point
            .views
            .iter()
            .filter(|&&v| poses[v].1.transform(&x).z > 0.0)
            .count();
    }
    count
}

/// `h` and its mirror through the first camera center, `h diag(1, 1, 1, -1)`.
///
/// Both leave every camera matrix unchanged up to sign; only one of them puts
/// the points in front of the first camera.
fn with_both_scale_signs(h: Matrix4<f64>) -> [Matrix4<f64>; 2] {
    let mut mirrored = h;
    mirrored.set_column(3, &(-h.column(3)));
    [h, mirrored]
}

/// The candidate upgrade placing the most observations in front of their cameras.
fn most_in_front(
    init: &ProjectiveInitialization,
    candidates: impl IntoIterator<Item = Matrix4<f64>>,
) -> Result<Matrix4<f64>, SfmError> {
    let mut best: Option<(usize, Matrix4<f64>)> = None;
    for h in candidates {
        let count = count_in_front(init, &h);
        log::debug!(target: "kornia_sfm::metric", "upgrade candidate with {count} observations in front");
        if best.as_ref().map_or(true, |(c, _)| count > *c) {
            best = Some((count, h));
        }
    }
    match best {
        Some((count, h)) if count > 0 => Ok(h),
        _ => Err(SfmError::MetricElevation("no upgrade places points in front of the cameras")),
    }
}

/// Upgrade given the calibration of every view.
///
/// The plane at infinity has two solutions and the metric scale two signs; the
/// combination placing the most points in front of the cameras is kept.
fn upgrade_given_k(init: &ProjectiveInitialization, intrinsics: &[PinholeCamera]) -> Result<Matrix4<f64>, SfmError> {
    let views = &init.structure.views;
    if views.len() < 2 || intrinsics.len() < views.len() {
        return Err(SfmError::MetricElevation("every cluster view needs intrinsics"));
    }
    let k1 = intrinsics[0].k_matrix();
    let candidates = plane_at_infinity_given_k(&views[1].pose, &k1, &intrinsics[1].k_matrix())?;
    most_in_front(
        init,
        candidates
            .iter()
            .flat_map(|v| with_both_scale_signs(projective_to_metric_h(&k1, v))),
    )
}

fn mean_focal(init: &ProjectiveInitialization, h: &Matrix4<f64>) -> Result<f64, SfmError> {
    let poses = metric_poses(init, h)?;
    let sum: f64 = poses.iter().map(|(k, _)| 0.5 * (k[(0, 0)].abs() + k[(1, 1)].abs())).sum();
    Ok(sum / poses.len() as f64)
}

/// Find the projective to metric upgrade of an initialized cluster.
///
/// With known intrinsics the plane at infinity is solved directly. Otherwise a
/// manual focal length is used when configured, then self-calibration, and
/// finally a focal length of half the seed image width.
pub fn estimate_metric_upgrade(
    init: &ProjectiveInitialization,
    intrinsics: ClusterIntrinsics<'_>,
    config: &ConfigMetric,
) -> Result<MetricUpgrade, SfmError> {
    let n = init.structure.views.len();
    let guessed = |f: f64| -> Result<MetricUpgrade, SfmError> {
        let h = upgrade_given_k(init, &vec![PinholeCamera::from_focal(f); n])?;
        Ok(MetricUpgrade {
            h,
            focal: f,
            self_calibrated: false,
        })
    };

    match intrinsics {
        ClusterIntrinsics::Known(cameras) => {
            let h = upgrade_given_k(init, cameras)?;
            let focal = cameras.iter().map(PinholeCamera::mean_focal).sum::<f64>() / cameras.len() as f64;
            Ok(MetricUpgrade {
                h,
                focal,
                self_calibrated: false,
            })
        }
        ClusterIntrinsics::Unknown => {
            if let Some(f) = config.manual_focal_length {
                return guessed(f);
            }
            let cameras: Vec<_> = init.structure.views.iter().map(|v| v.pose).collect();
            let seed = &init.structure.views[0];
            let solved = SelfCalibrationLinearDualQuadratic::new(config.self_calib_singular_threshold)
                .with_image_size(seed.width, seed.height)
                .solve(&cameras)
                .and_then(|solution| absolute_quadratic_to_h(&solution.q))
                .map_err(SfmError::from)
                .and_then(|h| most_in_front(init, with_both_scale_signs(h)));
            match solved {
                Ok(h) => {
                    let focal = mean_focal(init, &h)?;
                    log::info!(target: "kornia_sfm::metric", "self-calibrated focal length {focal:.1}");
                    Ok(MetricUpgrade {
                        h,
                        focal,
                        self_calibrated: true,
                    })
                }
                Err(e) => {
                    let f = 0.5 * init.structure.views[0].width as f64;
                    log::warn!(
                        target: "kornia_sfm::metric",
                        "self-calibration failed ({e}), guessing a focal length of {f:.1}"
                    );
                    guessed(f)
                }
            }
        }
    }
}

/// Metric scene of an initialized cluster under `upgrade`.
///
/// Translations are scaled so the largest is one and points are triangulated
/// from the observations. Known intrinsics give one fixed pinhole camera per view,
/// otherwise every view shares one simplified camera at the upgrade focal length.
pub fn elevate_cluster(
    init: &ProjectiveInitialization,
    upgrade: &MetricUpgrade,
    intrinsics: ClusterIntrinsics<'_>,
) -> Result<(SceneStructureMetric, SceneObservations), SfmError> {
    let mut poses: Vec<Se3> = metric_poses(init, &upgrade.h)?.into_iter().map(|(_, pose)| pose).collect();
    let reference = poses[0];
    // express everything relative to the first view
    let view_to_reference = reference.inverse();
    for pose in poses.iter_mut() {
        *pose = view_to_reference.then(pose);
    }
    let max_translation = poses.iter().map(|p| p.translation.norm()).fold(0.0, f64::max);
    if max_translation < 1e-12 || !max_translation.is_finite() {
        return Err(SfmError::MetricElevation("cluster has no baseline"));
    }
    for pose in poses.iter_mut() {
        pose.translation /= max_translation;
    }

    let mut structure = SceneStructureMetric::new();
    match intrinsics {
        ClusterIntrinsics::Known(cameras) => {
            for camera in cameras.iter().take(poses.len()) {
                structure.cameras.push(SceneCamera {
                    known: true,
                    model: BundleCamera::Pinhole(*camera),
                });
            }
        }
        ClusterIntrinsics::Unknown => structure.cameras.push(SceneCamera {
            known: false,
            model: BundleCamera::Simplified(BundlePinholeSimplified::new(upgrade.focal)),
        }),
    }
    for (i, (view, pose)) in init.structure.views.iter().zip(&poses).enumerate() {
        structure.views.push(SceneView {
            id: view.id.clone(),
            known: i == 0,
            pose: *pose,
            camera: Some(if structure.cameras.len() == 1 { 0 } else { i }),
            width: view.width,
            height: view.height,
        });
    }

    for point in &init.structure.points {
        let id = structure.add_point(Vector3::zeros());
        for &v in &point.views {
            structure.connect_point_to_view(id, v);
        }
    }
    retriangulate(&mut structure, &init.observations);
    Ok((structure, init.observations.clone()))
}

/// Triangulate every point again from its observations and the current poses.
pub fn retriangulate(structure: &mut SceneStructureMetric, observations: &SceneObservations) {
    let mut norms: Vec<Vec<Vector2<f64>>> = vec![Vec::new(); structure.points.len()];
    let mut poses: Vec<Vec<Se3>> = vec![Vec::new(); structure.points.len()];
    for (v, obs) in observations.views.iter().enumerate() {
        let view = &structure.views[v];
        let Some(camera) = view.camera.map(|c| structure.cameras[c].model) else {
            continue;
        };
        for (&p, pixel) in obs.points.iter().zip(&obs.pixels) {
            norms[p].push(camera.pixel_to_norm(pixel));
            poses[p].push(view.pose);
        }
    }
    for (p, point) in structure.points.iter_mut().enumerate() {
        if let Some(x) = triangulate_metric(&norms[p], &poses[p]) {
            point.coordinate = x;
        }
    }
}

/// Fraction of the point observations that lie behind their camera.
pub fn fraction_behind(structure: &SceneStructureMetric) -> f64 {
    let mut total = 0usize;
    let mut behind = 0usize;
    for (p, point) in structure.points.iter().enumerate() {
        for &v in &point.views {
            total += 1;
            if structure.depth(v, p) < 0.0 {
                behind += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        behind as f64 / total as f64
    }
}

/// Bundle adjustment followed by a sanity check on the sign of the solution.
///
/// When more than half of the observations end up behind their camera, every
/// unknown rotation is flipped starting from the state before optimization,
/// the points are triangulated again and the scene is optimized once more. The
/// candidate with the lower cost is kept.
pub fn bundle_with_flip_check(
    structure: &mut SceneStructureMetric,
    observations: &SceneObservations,
    converge: ConfigConverge,
) -> Result<BundleSummary, SfmError> {
    let bundle = BundleAdjustment::new(converge);
    let initial = structure.clone();
    let summary = bundle.optimize_metric(structure, observations)?;
    let behind = fraction_behind(structure);
    if behind <= 0.5 {
        return Ok(summary);
    }

    log::warn!(
        target: "kornia_sfm::metric",
        "{:.0}% of observations behind the cameras, trying flipped rotations",
        100.0 * behind
    );
    let mut flipped = initial;
    for view in flipped.views.iter_mut().filter(|v| !v.known) {
        view.pose.rotation = view.pose.rotation.transpose();
    }
    retriangulate(&mut flipped, observations);
    let flipped_summary = bundle.optimize_metric(&mut flipped, observations)?;
    if flipped_summary.final_cost < summary.final_cost {
        *structure = flipped;
        return Ok(flipped_summary);
    }
    Ok(summary)
}

/// Final refinement of a metric scene.
///
/// Bundle adjustment, pruning by error rank and of observations behind the cameras,
/// alternating point and view pruning until nothing changes, removal of unused
/// cameras and a last bundle adjustment.
pub fn refine_metric_scene(
    structure: &mut SceneStructureMetric,
    observations: &mut SceneObservations,
    config: &ConfigMetric,
) -> Result<BundleSummary, SfmError> {
    let bundle = BundleAdjustment::new(config.converge_sba);
    bundle.optimize_metric(structure, observations)?;
    {
        let mut prune = PruneStructureFromScene::new(structure, observations);
        prune.prune_observations_by_error_rank(config.prune_fraction);
        prune.prune_observations_behind_camera();
        loop {
            prune.prune_points(config.min_point_views);
            if !prune.prune_views(config.min_view_observations) {
                break;
            }
        }
        prune.prune_unused_cameras();
    }
    if structure.views.len() < 2 {
        return Err(SfmError::TooFewViews(structure.views.len()));
    }
    if !structure.views.iter().any(|v| v.known) {
        // the reference view was pruned, fix the gauge on the first remaining one
        structure.views[0].known = true;
    }
    let summary = bundle.optimize_metric(structure, observations)?;
    log::info!(
        target: "kornia_sfm::metric",
        "refined {} views and {} points, cost {:.4e}",
        structure.views.len(),
        structure.points.len(),
        summary.final_cost
    );
    Ok(summary)
}
