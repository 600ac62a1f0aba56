//! Sparse bundle adjustment.
//!
//! Levenberg-Marquardt over view/camera parameters and points, eliminating the
//! points with the Schur complement so that only the reduced camera system is
//! solved densely. Jacobians are computed with central differences.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, Matrix3x4, Vector2, Vector3, Vector4};

use crate::config::ConfigConverge;
use crate::error::SfmError;
use crate::geometry::camera::BundleCamera;
use crate::geometry::se3::Se3;
use crate::structure::{SceneObservations, SceneStructureMetric, SceneStructureProjective};

// squared residual charged to observations that cannot be projected
const PROJECTION_PENALTY: f64 = 1e6;

/// Outcome of a bundle adjustment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BundleSummary {
    /// Sum of squared residuals before optimization.
    pub initial_cost: f64,
    /// Sum of squared residuals after optimization.
    pub final_cost: f64,
    /// Number of accepted steps.
    pub iterations: usize,
    /// Whether a convergence test was met.
    pub converged: bool,
}

struct Observation {
    view: usize,
    point: usize,
    pixel: Vector2<f64>,
}

trait BundleModel {
    fn point_dim(&self) -> usize;

    fn frame_len(&self) -> usize;

    /// Frame parameters that affect the projections into `view`.
    fn view_params(&self, view: usize) -> &[usize];

    fn project(&self, frame: &[f64], view: usize, point: &[f64]) -> Option<Vector2<f64>>;

    /// Remove scale drift after an accepted step.
    fn normalize(&self, _frame: &mut [f64], _points: &mut [f64]) {}
}

struct MetricSlot {
    pose: Se3,
    pose_offset: Option<usize>,
    camera: usize,
}

struct MetricModel {
    slots: Vec<MetricSlot>,
    cameras: Vec<BundleCamera>,
    camera_offsets: Vec<Option<usize>>,
    view_params: Vec<Vec<usize>>,
    frame_len: usize,
}

fn pose_from(frame: &[f64], offset: usize) -> Se3 {
    Se3::from_rodrigues(
        &Vector3::new(frame[offset], frame[offset + 1], frame[offset + 2]),
        Vector3::new(frame[offset + 3], frame[offset + 4], frame[offset + 5]),
    )
}

impl MetricModel {
    fn build(scene: &SceneStructureMetric) -> Result<(Self, Vec<f64>, Vec<f64>), SfmError> {
        let mut frame = Vec::new();
        let mut slots = Vec::with_capacity(scene.views.len());
        for view in &scene.views {
            let camera = view
                .camera
                .filter(|&c| c < scene.cameras.len())
                .ok_or(SfmError::BundleAdjustment("view without a valid camera"))?;
            if !view.pose.is_finite() {
                return Err(SfmError::BundleAdjustment("non-finite pose"));
            }
            let pose_offset = if view.known {
                None
            } else {
                let offset = frame.len();
                frame.extend(view.pose.rodrigues().iter());
                frame.extend(view.pose.translation.iter());
                Some(offset)
            };
            slots.push(MetricSlot {
                pose: view.pose,
                pose_offset,
                camera,
            });
        }

        let mut camera_offsets = Vec::with_capacity(scene.cameras.len());
        for camera in &scene.cameras {
            let params = camera.model.parameters();
            if camera.known || params.is_empty() {
                camera_offsets.push(None);
            } else {
                camera_offsets.push(Some(frame.len()));
                frame.extend(params);
            }
        }

        let view_params = slots
            .iter()
            .map(|slot| {
                let mut params: Vec<usize> = Vec::new();
                if let Some(o) = slot.pose_offset {
                    params.extend(o..o + 6);
                }
                if let Some(o) = camera_offsets[slot.camera] {
                    params.extend(o..o + scene.cameras[slot.camera].model.parameter_count());
                }
                params
            })
            .collect();

        let points = scene
            .points
            .iter()
            .flat_map(|p| p.coordinate.iter().copied().collect::<Vec<_>>())
            .collect();

        let model = Self {
            slots,
            cameras: scene.cameras.iter().map(|c| c.model).collect(),
            camera_offsets,
            view_params,
            frame_len: frame.len(),
        };
        Ok((model, frame, points))
    }

    fn camera(&self, frame: &[f64], index: usize) -> BundleCamera {
        let mut camera = self.cameras[index];
        if let Some(o) = self.camera_offsets[index] {
            camera.set_parameters(&frame[o..o + camera.parameter_count()]);
        }
        camera
    }

    fn write_back(&self, scene: &mut SceneStructureMetric, frame: &[f64], points: &[f64]) {
        for (view, slot) in scene.views.iter_mut().zip(&self.slots) {
            if let Some(o) = slot.pose_offset {
                view.pose = pose_from(frame, o);
            }
        }
        for (i, camera) in scene.cameras.iter_mut().enumerate() {
            if self.camera_offsets[i].is_some() {
                camera.model = self.camera(frame, i);
            }
        }
        for (i, point) in scene.points.iter_mut().enumerate() {
            point.coordinate = Vector3::new(points[3 * i], points[3 * i + 1], points[3 * i + 2]);
        }
    }
}

impl BundleModel for MetricModel {
    fn point_dim(&self) -> usize {
        3
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn view_params(&self, view: usize) -> &[usize] {
        &self.view_params[view]
    }

    fn project(&self, frame: &[f64], view: usize, point: &[f64]) -> Option<Vector2<f64>> {
        let slot = &self.slots[view];
        let pose = match slot.pose_offset {
            Some(o) => pose_from(frame, o),
            None => slot.pose,
        };
        let x = pose.transform(&Vector3::new(point[0], point[1], point[2]));
        self.camera(frame, slot.camera).project(&x)
    }
}

struct ProjectiveModel {
    cameras: Vec<Matrix3x4<f64>>,
    offsets: Vec<Option<usize>>,
    view_params: Vec<Vec<usize>>,
    frame_len: usize,
}

impl ProjectiveModel {
    fn build(scene: &SceneStructureProjective) -> (Self, Vec<f64>, Vec<f64>) {
        let mut frame = Vec::new();
        let mut offsets = Vec::with_capacity(scene.views.len());
        for view in &scene.views {
            if view.known {
                offsets.push(None);
            } else {
                offsets.push(Some(frame.len()));
                // row major
                frame.extend(view.pose.transpose().iter());
            }
        }
        let view_params = offsets
            .iter()
            .map(|o| o.map(|o| (o..o + 12).collect()).unwrap_or_default())
            .collect();
        let points = scene
            .points
            .iter()
            .flat_map(|p| p.coordinate.iter().copied().collect::<Vec<_>>())
            .collect();
        let model = Self {
            cameras: scene.views.iter().map(|v| v.pose).collect(),
            offsets,
            view_params,
            frame_len: frame.len(),
        };
        (model, frame, points)
    }

    fn camera(&self, frame: &[f64], view: usize) -> Matrix3x4<f64> {
        match self.offsets[view] {
            Some(o) => Matrix3x4::from_row_slice(&frame[o..o + 12]),
            None => self.cameras[view],
        }
    }

    fn write_back(&self, scene: &mut SceneStructureProjective, frame: &[f64], points: &[f64]) {
        for (i, view) in scene.views.iter_mut().enumerate() {
            view.pose = self.camera(frame, i);
        }
        for (i, point) in scene.points.iter_mut().enumerate() {
            point.coordinate = Vector4::from_column_slice(&points[4 * i..4 * i + 4]);
        }
    }
}

impl BundleModel for ProjectiveModel {
    fn point_dim(&self) -> usize {
        4
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn view_params(&self, view: usize) -> &[usize] {
        &self.view_params[view]
    }

    fn project(&self, frame: &[f64], view: usize, point: &[f64]) -> Option<Vector2<f64>> {
        let h = self.camera(frame, view) * Vector4::from_column_slice(point);
        if h.z.abs() < 1e-12 {
            return None;
        }
        Some(Vector2::new(h.x / h.z, h.y / h.z))
    }

    fn normalize(&self, frame: &mut [f64], points: &mut [f64]) {
        for chunk in points.chunks_mut(4) {
            let norm = chunk.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                chunk.iter_mut().for_each(|v| *v /= norm);
            }
        }
        for o in self.offsets.iter().flatten() {
            let camera = &mut frame[*o..*o + 12];
            let norm = camera.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                camera.iter_mut().for_each(|v| *v /= norm);
            }
        }
    }
}

fn collect_observations(
    observations: &SceneObservations,
    n_views: usize,
    n_points: usize,
) -> Result<Vec<Observation>, SfmError> {
    if observations.views.len() != n_views {
        return Err(SfmError::BundleAdjustment("observations do not match the views"));
    }
    let mut out = Vec::with_capacity(observations.total());
    for (view, obs) in observations.views.iter().enumerate() {
        for (&point, pixel) in obs.points.iter().zip(&obs.pixels) {
            if point >= n_points {
                return Err(SfmError::BundleAdjustment("observation of an unknown point"));
            }
            out.push(Observation {
                view,
                point,
                pixel: *pixel,
            });
        }
    }
    Ok(out)
}

fn residual<M: BundleModel>(model: &M, frame: &[f64], point: &[f64], obs: &Observation) -> Option<Vector2<f64>> {
    model.project(frame, obs.view, point).map(|p| p - obs.pixel)
}

fn total_cost<M: BundleModel>(model: &M, frame: &[f64], points: &[f64], obs: &[Observation]) -> f64 {
    let d = model.point_dim();
    obs.iter()
        .map(|o| {
            residual(model, frame, &points[o.point * d..(o.point + 1) * d], o)
                .map(|r| r.norm_squared())
                .unwrap_or(PROJECTION_PENALTY)
        })
        .sum()
}

fn step_size(x: f64) -> f64 {
    1e-6 * x.abs().max(1.0)
}

/// Normal equations with the point blocks kept separate.
struct NormalEquations {
    u: DMatrix<f64>,
    g_f: DVector<f64>,
    v: Vec<DMatrix<f64>>,
    g_p: Vec<DVector<f64>>,
    w: Vec<BTreeMap<usize, DVector<f64>>>,
}

fn linearize<M: BundleModel>(
    model: &M,
    frame: &[f64],
    points: &[f64],
    obs: &[Observation],
    n_points: usize,
) -> NormalEquations {
    let d = model.point_dim();
    let nf = model.frame_len();
    let mut eq = NormalEquations {
        u: DMatrix::zeros(nf, nf),
        g_f: DVector::zeros(nf),
        v: vec![DMatrix::zeros(d, d); n_points],
        g_p: vec![DVector::zeros(d); n_points],
        w: vec![BTreeMap::new(); n_points],
    };

    let mut frame_work = frame.to_vec();
    let mut point_work = vec![0.0; d];
    for o in obs {
        let point = &points[o.point * d..(o.point + 1) * d];
        let Some(r) = residual(model, frame, point, o) else {
            continue;
        };
        let params = model.view_params(o.view);

        let mut j_f = DMatrix::<f64>::zeros(2, params.len());
        for (col, &k) in params.iter().enumerate() {
            let h = step_size(frame[k]);
            frame_work[k] = frame[k] + h;
            let plus = residual(model, &frame_work, point, o);
            frame_work[k] = frame[k] - h;
            let minus = residual(model, &frame_work, point, o);
            frame_work[k] = frame[k];
            if let (Some(plus), Some(minus)) = (plus, minus) {
                j_f.set_column(col, &((plus - minus) / (2.0 * h)));
            }
        }

        let mut j_p = DMatrix::<f64>::zeros(2, d);
        point_work.copy_from_slice(point);
        for k in 0..d {
            let h = step_size(point[k]);
            point_work[k] = point[k] + h;
            let plus = residual(model, frame, &point_work, o);
            point_work[k] = point[k] - h;
            let minus = residual(model, frame, &point_work, o);
            point_work[k] = point[k];
            if let (Some(plus), Some(minus)) = (plus, minus) {
                j_p.set_column(k, &((plus - minus) / (2.0 * h)));
            }
        }

        let jf_t = j_f.transpose();
        let jtj_f = &jf_t * &j_f;
        let jtr_f = &jf_t * r;
        let wj = &jf_t * &j_p;
        for (a, &ka) in params.iter().enumerate() {
            eq.g_f[ka] += jtr_f[a];
            for (b, &kb) in params.iter().enumerate() {
                eq.u[(ka, kb)] += jtj_f[(a, b)];
            }
            *eq.w[o.point].entry(ka).or_insert_with(|| DVector::zeros(d)) += wj.row(a).transpose();
        }

        let jp_t = j_p.transpose();
        eq.v[o.point] += &jp_t * &j_p;
        eq.g_p[o.point] += &jp_t * r;
    }
    eq
}

fn damp(m: &DMatrix<f64>, lambda: f64) -> DMatrix<f64> {
    let mut out = m.clone();
    for i in 0..m.nrows() {
        out[(i, i)] += lambda * m[(i, i)].max(1e-9) + 1e-12;
    }
    out
}

/// Solve the damped system. Returns the frame and point increments.
fn solve_step(eq: &NormalEquations, lambda: f64) -> Option<(DVector<f64>, Vec<DVector<f64>>)> {
    let nf = eq.u.nrows();
    let mut s = damp(&eq.u, lambda);
    let mut rhs = -&eq.g_f;

    let mut v_inv = Vec::with_capacity(eq.v.len());
    for (j, v) in eq.v.iter().enumerate() {
        let inv = damp(v, lambda).try_inverse()?;
        let y: Vec<(usize, DVector<f64>)> = eq.w[j].iter().map(|(&a, wa)| (a, &inv * wa)).collect();
        for (a, ya) in &y {
            rhs[*a] += ya.dot(&eq.g_p[j]);
            for (b, wb) in &eq.w[j] {
                s[(*a, *b)] -= ya.dot(wb);
            }
        }
        v_inv.push(inv);
    }

    let delta_f = if nf > 0 {
        s.cholesky()?.solve(&rhs)
    } else {
        DVector::zeros(0)
    };

    let delta_p = v_inv
        .iter()
        .enumerate()
        .map(|(j, inv)| {
            let mut b = -&eq.g_p[j];
            for (&a, wa) in &eq.w[j] {
                b -= wa * delta_f[a];
            }
            inv * b
        })
        .collect();
    Some((delta_f, delta_p))
}

fn levenberg_marquardt<M: BundleModel>(
    model: &M,
    frame: &mut Vec<f64>,
    points: &mut Vec<f64>,
    obs: &[Observation],
    n_points: usize,
    converge: &ConfigConverge,
) -> Result<BundleSummary, SfmError> {
    let d = model.point_dim();
    let mut cost = total_cost(model, frame, points, obs);
    if !cost.is_finite() {
        return Err(SfmError::BundleAdjustment("non-finite cost"));
    }
    let mut summary = BundleSummary {
        initial_cost: cost,
        final_cost: cost,
        iterations: 0,
        converged: false,
    };
    let mut lambda = 1e-3;

    for _ in 0..converge.max_iterations {
        let eq = linearize(model, frame, points, obs, n_points);
        let gradient = || eq.g_f.iter().chain(eq.g_p.iter().flat_map(|g| g.iter()));
        if gradient().any(|v| !v.is_finite()) {
            return Err(SfmError::BundleAdjustment("non-finite gradient"));
        }
        let g_max = gradient().fold(0.0f64, |acc, v| acc.max(v.abs()));
        if g_max <= converge.gtol {
            summary.converged = true;
            break;
        }

        let mut accepted = false;
        while lambda < 1e12 {
            let Some((delta_f, delta_p)) = solve_step(&eq, lambda) else {
                lambda *= 10.0;
                continue;
            };
            let mut frame_new: Vec<f64> = frame.iter().zip(delta_f.iter()).map(|(x, dx)| x + dx).collect();
            let mut points_new = points.clone();
            for (j, dp) in delta_p.iter().enumerate() {
                for k in 0..d {
                    points_new[j * d + k] += dp[k];
                }
            }
            model.normalize(&mut frame_new, &mut points_new);

            let cost_new = total_cost(model, &frame_new, &points_new, obs);
            if cost_new < cost {
                let decrease = cost - cost_new;
                *frame = frame_new;
                *points = points_new;
                summary.converged = decrease <= converge.ftol * cost;
                cost = cost_new;
                lambda = (lambda * 0.1).max(1e-9);
                accepted = true;
                break;
            }
            lambda *= 10.0;
        }

        if !accepted {
            summary.converged = true;
            break;
        }
        summary.iterations += 1;
        if summary.converged {
            break;
        }
    }

    summary.final_cost = cost;
    Ok(summary)
}

/// Bundle adjustment of metric and projective scenes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BundleAdjustment {
    /// Convergence criteria.
    pub converge: ConfigConverge,
}

impl BundleAdjustment {
    /// Create an optimizer.
    pub fn new(converge: ConfigConverge) -> Self {
        Self { converge }
    }

    /// Refine unknown poses, unknown cameras and every point of a metric scene.
    pub fn optimize_metric(
        &self,
        scene: &mut SceneStructureMetric,
        observations: &SceneObservations,
    ) -> Result<BundleSummary, SfmError> {
        let obs = collect_observations(observations, scene.views.len(), scene.points.len())?;
        let (model, mut frame, mut points) = MetricModel::build(scene)?;
        let summary = levenberg_marquardt(
            &model,
            &mut frame,
            &mut points,
            &obs,
            scene.points.len(),
            &self.converge,
        )?;
        // parameters only round trip exactly when untouched
        if summary.iterations > 0 {
            model.write_back(scene, &frame, &points);
        }
        log::debug!(
            target: "kornia_sfm::bundle",
            "metric: cost {:.4e} -> {:.4e} in {} steps, {} observations",
            summary.initial_cost,
            summary.final_cost,
            summary.iterations,
            obs.len()
        );
        Ok(summary)
    }

    /// Refine unknown camera matrices and every point of a projective scene.
    pub fn optimize_projective(
        &self,
        scene: &mut SceneStructureProjective,
        observations: &SceneObservations,
    ) -> Result<BundleSummary, SfmError> {
        let obs = collect_observations(observations, scene.views.len(), scene.points.len())?;
        let (model, mut frame, mut points) = ProjectiveModel::build(scene);
        let summary = levenberg_marquardt(
            &model,
            &mut frame,
            &mut points,
            &obs,
            scene.points.len(),
            &self.converge,
        )?;
        // parameters only round trip exactly when untouched
        if summary.iterations > 0 {
            model.write_back(scene, &frame, &points);
        }
        log::debug!(
            target: "kornia_sfm::bundle",
            "projective: cost {:.4e} -> {:.4e} in {} steps, {} observations",
            summary.initial_cost,
            summary.final_cost,
            summary.iterations,
            obs.len()
        );
        Ok(summary)
    }
}

/// Sum of squared reprojection errors of a metric scene, in pixels².
pub fn metric_fit_score(scene: &SceneStructureMetric, observations: &SceneObservations) -> f64 {
    let mut cost = 0.0;
    for (view, obs) in observations.views.iter().enumerate() {
        for (&point, pixel) in obs.points.iter().zip(&obs.pixels) {
            cost += scene
                .project(view, point)
                .map(|p| (p - pixel).norm_squared())
                .unwrap_or(PROJECTION_PENALTY);
        }
    }
    cost
}
