use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix4, SMatrix, SVector, Vector2, Vector3, Vector4};

use crate::config::ConfigRansac;
use crate::error::GeometryError;
use crate::geometry::linalg::{normalize_points_2d, null_vector, svd3};
use crate::geometry::ransac::{ransac, RansacEstimator};
use crate::geometry::se3::Se3;

/// A known 3D location and its normalized image observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point2D3D {
    /// Observation in normalized image coordinates.
    pub observation: Vector2<f64>,
    /// Location in the world frame.
    pub location: Vector3<f64>,
}

impl Point2D3D {
    /// Create a new correspondence.
    pub fn new(observation: Vector2<f64>, location: Vector3<f64>) -> Self {
        Self {
            observation,
            location,
        }
    }
}

fn check_lengths(left: usize, right: usize, required: usize) -> Result<(), GeometryError> {
    if left != right {
        return Err(GeometryError::MismatchedLengths { left, right });
    }
    if left < required {
        return Err(GeometryError::InsufficientCorrespondences {
            required,
            actual: left,
        });
    }
    Ok(())
}

fn camera_dlt(points: &[Vector4<f64>], pixels: &[Vector2<f64>]) -> Matrix3x4<f64> {
    let mut a = DMatrix::<f64>::zeros(2 * points.len(), 12);
    for (i, (x, u)) in points.iter().zip(pixels).enumerate() {
        for j in 0..4 {
            a[(2 * i, j)] = -x[j];
            a[(2 * i, 8 + j)] = u.x * x[j];
            a[(2 * i + 1, 4 + j)] = -x[j];
            a[(2 * i + 1, 8 + j)] = u.y * x[j];
        }
    }
    let (p, _) = null_vector(&a);
    Matrix3x4::from_row_slice(p.as_slice())
}

/// Linear estimate of a projective camera matrix from six or more 2D-3D correspondences.
///
/// The points are homogeneous and the result has unit Frobenius norm.
pub fn pose_from_pair_linear6(
    points: &[Vector4<f64>],
    pixels: &[Vector2<f64>],
) -> Result<Matrix3x4<f64>, GeometryError> {
    check_lengths(points.len(), pixels.len(), 6)?;

    let (pixels_n, n) = normalize_points_2d(pixels);
    let points_n: Vec<Vector4<f64>> = points.iter().map(|x| x.normalize()).collect();
    let p_n = camera_dlt(&points_n, &pixels_n);

    let n_inv = n
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular normalization"))?;
    let p = n_inv * p_n;
    let norm = p.norm();
    if norm < 1e-300 || !norm.is_finite() {
        return Err(GeometryError::Degenerate("camera matrix vanished"));
    }
    Ok(p / norm)
}

/// Linear estimate of a calibrated pose from six or more correspondences.
///
/// Returns the world to view transform. The rotation is the closest rotation
/// to the left block of the DLT solution.
pub fn pnp_dlt(points: &[Point2D3D]) -> Result<Se3, GeometryError> {
    check_lengths(points.len(), points.len(), 6)?;

    // center and scale the world points for conditioning
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.location) / n;
    let spread = points
        .iter()
        .map(|p| (p.location - centroid).norm())
        .sum::<f64>()
        / n;
    if spread < 1e-12 {
        return Err(GeometryError::Degenerate("coincident world points"));
    }
    let s = 3.0f64.sqrt() / spread;
    let homogeneous: Vec<Vector4<f64>> = points
        .iter()
        .map(|p| ((p.location - centroid) * s).push(1.0))
        .collect();
    let observations: Vec<Vector2<f64>> = points.iter().map(|p| p.observation).collect();
    let p_n = camera_dlt(&homogeneous, &observations);

    let mut t = Matrix4::identity() * s;
    t[(3, 3)] = 1.0;
    t.fixed_view_mut::<3, 1>(0, 3).copy_from(&(-s * centroid));
    let mut p = p_n * t;

    let mut m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
    if m.determinant() < 0.0 {
        p = -p;
        m = -m;
    }
    let (u, sv, v) = svd3(&m);
    let scale = sv.mean();
    if scale < 1e-300 || !scale.is_finite() {
        return Err(GeometryError::Degenerate("pose matrix vanished"));
    }
    let rotation = u * v.transpose();
    let translation = p.column(3) / scale;
    Ok(Se3::new(rotation, translation))
}

fn residuals(points: &[Point2D3D], params: &SVector<f64, 6>, out: &mut Vec<f64>) {
    let pose = Se3::from_rodrigues(
        &params.fixed_rows::<3>(0).into_owned(),
        params.fixed_rows::<3>(3).into_owned(),
    );
    out.clear();
    for p in points {
        let x = pose.transform(&p.location);
        if x.z.abs() < 1e-12 {
            out.extend_from_slice(&[1e3, 1e3]);
            continue;
        }
        out.push(x.x / x.z - p.observation.x);
        out.push(x.y / x.z - p.observation.y);
    }
}

/// Refine a pose with Levenberg-Marquardt on the normalized reprojection error.
pub fn refine_pose(points: &[Point2D3D], pose: &Se3, max_iterations: usize) -> Se3 {
    let mut params = SVector::<f64, 6>::zeros();
    params.fixed_rows_mut::<3>(0).copy_from(&pose.rodrigues());
    params.fixed_rows_mut::<3>(3).copy_from(&pose.translation);

    let mut r = Vec::new();
    let mut r_plus = Vec::new();
    let mut r_minus = Vec::new();
    residuals(points, &params, &mut r);
    let mut cost: f64 = r.iter().map(|v| v * v).sum();
    let mut lambda = 1e-3;

    for _ in 0..max_iterations {
        let mut jtj = SMatrix::<f64, 6, 6>::zeros();
        let mut jtr = SVector::<f64, 6>::zeros();
        let mut jac = vec![SVector::<f64, 6>::zeros(); r.len()];
        for k in 0..6 {
            let h = 1e-7 * params[k].abs().max(1.0);
            let mut plus = params;
            plus[k] += h;
            let mut minus = params;
            minus[k] -= h;
            residuals(points, &plus, &mut r_plus);
            residuals(points, &minus, &mut r_minus);
            for (i, row) in jac.iter_mut().enumerate() {
                row[k] = (r_plus[i] - r_minus[i]) / (2.0 * h);
            }
        }
        for (row, ri) in jac.iter().zip(r.iter()) {
            jtj += row * row.transpose();
            jtr += row * *ri;
        }
        if jtr.amax() < 1e-14 {
            break;
        }

        let mut improved = false;
        while lambda < 1e10 {
            let mut damped = jtj;
            for k in 0..6 {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let candidate = params - chol.solve(&jtr);
            residuals(points, &candidate, &mut r_plus);
            let candidate_cost: f64 = r_plus.iter().map(|v| v * v).sum();
            if candidate_cost < cost {
                let decrease = cost - candidate_cost;
                params = candidate;
                std::mem::swap(&mut r, &mut r_plus);
                cost = candidate_cost;
                lambda = (lambda * 0.1).max(1e-12);
                improved = decrease > 1e-16 * cost.max(1e-300);
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }

    Se3::from_rodrigues(
        &params.fixed_rows::<3>(0).into_owned(),
        params.fixed_rows::<3>(3).into_owned(),
    )
}

/// Squared normalized reprojection error of a correspondence, infinite behind the camera.
pub fn pnp_error(pose: &Se3, point: &Point2D3D) -> f64 {
    let x = pose.transform(&point.location);
    if x.z <= 0.0 {
        return f64::INFINITY;
    }
    (Vector2::new(x.x / x.z, x.y / x.z) - point.observation).norm_squared()
}

/// Calibrated pose model for [`crate::geometry::ransac::ransac`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PnPEstimator;

impl RansacEstimator for PnPEstimator {
    type Datum = Point2D3D;
    type Model = Se3;

    fn sample_size(&self) -> usize {
        6
    }

    fn fit(&self, sample: &[Point2D3D]) -> Option<Se3> {
        pnp_dlt(sample).ok()
    }

    fn error(&self, model: &Se3, datum: &Point2D3D) -> f64 {
        pnp_error(model, datum)
    }
}

/// Result of a robust calibrated pose estimate.
#[derive(Clone, Debug)]
pub struct PnPRansacResult {
    /// World to view transform.
    pub world_to_view: Se3,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
}

/// Estimate a calibrated pose robustly, then refine it on the inliers.
///
/// The RANSAC threshold is given in pixels and converted to normalized units with `focal`.
pub fn solve_pnp_ransac(
    points: &[Point2D3D],
    params: &ConfigRansac,
    focal: f64,
) -> Result<PnPRansacResult, GeometryError> {
    let normalized = ConfigRansac {
        inlier_threshold: params.inlier_threshold / focal,
        ..*params
    };
    let result = ransac(&PnPEstimator, points, &normalized)?;
    let inlier_points: Vec<Point2D3D> = result.inliers.iter().map(|&i| points[i]).collect();
    let world_to_view = refine_pose(&inlier_points, &result.model, 20);
    Ok(PnPRansacResult {
        world_to_view,
        inliers: result.inliers,
    })
}
