use nalgebra::{Cholesky, DMatrix, Matrix3, Matrix3x4, Matrix4, Vector3};

use crate::error::GeometryError;
use crate::geometry::linalg::null_vector;

// unknowns of the symmetric dual absolute quadric, row major upper triangle
const QUADRIC_INDEX: [(usize, usize); 10] = [
    (0, 0),
    (0, 1),
    (0, 2),
    (0, 3),
    (1, 1),
    (1, 2),
    (1, 3),
    (2, 2),
    (2, 3),
    (3, 3),
];

/// Focal lengths recovered by self-calibration for one camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FocalLengths {
    /// Focal length along x.
    pub fx: f64,
    /// Focal length along y.
    pub fy: f64,
}

impl FocalLengths {
    /// Mean of both focal lengths.
    pub fn mean(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }
}

/// Output of the linear self-calibration.
#[derive(Clone, Debug)]
pub struct DualQuadricSolution {
    /// The dual absolute quadric, rank 3 with a non-negative diagonal.
    pub q: Matrix4<f64>,
    /// Focal lengths of every input camera.
    pub focal_lengths: Vec<FocalLengths>,
}

/// Linear self-calibration through the dual absolute quadric.
///
/// Assumes zero skew, a known aspect ratio and the principal point at the
/// origin, so pixels must be centered on the image. Each camera contributes
/// four linear constraints on `ω* = P Q Pᵀ`, hence at least three cameras are needed.
///
/// Cameras whose optical axes all meet in one point are a critical motion: the
/// focal lengths are free to vary along a one parameter family and the solver fails.
#[derive(Clone, Copy, Debug)]
pub struct SelfCalibrationLinearDualQuadratic {
    /// Fail when the smallest singular value is not this much smaller than the next one.
    pub singular_threshold: f64,
    /// Ratio `fy / fx`.
    pub aspect_ratio: f64,
    /// Pixels are divided by this before building the linear system, usually half the image size.
    pub image_scale: f64,
}

impl Default for SelfCalibrationLinearDualQuadratic {
    fn default() -> Self {
        Self {
            singular_threshold: 1e-3,
            aspect_ratio: 1.0,
            image_scale: 1.0,
        }
    }
}

fn quadric_coefficient(p: &Matrix3x4<f64>, i: usize, j: usize, (a, b): (usize, usize)) -> f64 {
    if a == b {
        p[(i, a)] * p[(j, a)]
    } else {
        p[(i, a)] * p[(j, b)] + p[(i, b)] * p[(j, a)]
    }
}

impl SelfCalibrationLinearDualQuadratic {
    /// Create a solver with the given singular value threshold and unit aspect ratio.
    pub fn new(singular_threshold: f64) -> Self {
        Self {
            singular_threshold,
            ..Default::default()
        }
    }

    /// Condition the linear system for images of the given size.
    pub fn with_image_size(mut self, width: u32, height: u32) -> Self {
        self.image_scale = 0.5 * width.max(height).max(1) as f64;
        self
    }

    /// Estimate the dual absolute quadric and the focal length of every camera.
    pub fn solve(&self, cameras: &[Matrix3x4<f64>]) -> Result<DualQuadricSolution, GeometryError> {
        if cameras.len() < 3 {
            return Err(GeometryError::InsufficientCorrespondences {
                required: 3,
                actual: cameras.len(),
            });
        }

        if !(self.image_scale.is_finite() && self.image_scale > 0.0) {
            return Err(GeometryError::Degenerate("image scale must be positive"));
        }
        // ω* = P Q Pᵀ holds for the rescaled cameras N P with the same Q
        let s = 1.0 / self.image_scale;
        let n = Matrix3::new(s, 0.0, 0.0, 0.0, s, 0.0, 0.0, 0.0, 1.0);

        let r2 = self.aspect_ratio * self.aspect_ratio;
        let mut a = DMatrix::<f64>::zeros(4 * cameras.len(), 10);
        for (c, p) in cameras.iter().enumerate() {
            let p = n * p;
            let p = p / p.norm();
            for (k, idx) in QUADRIC_INDEX.iter().enumerate() {
                a[(4 * c, k)] = quadric_coefficient(&p, 0, 1, *idx);
                a[(4 * c + 1, k)] = quadric_coefficient(&p, 0, 2, *idx);
                a[(4 * c + 2, k)] = quadric_coefficient(&p, 1, 2, *idx);
                a[(4 * c + 3, k)] =
                    r2 * quadric_coefficient(&p, 0, 0, *idx) - quadric_coefficient(&p, 1, 1, *idx);
            }
        }

        let (x, sv) = null_vector(&a);
        let n = sv.len();
        if self.singular_threshold * sv[n - 2] <= sv[n - 1] {
            return Err(GeometryError::Degenerate("quadric null space is not one dimensional"));
        }

        let mut q = Matrix4::zeros();
        for (k, &(i, j)) in QUADRIC_INDEX.iter().enumerate() {
            q[(i, j)] = x[k];
            q[(j, i)] = x[k];
        }
        if q[(0, 0)] < 0.0 || q[(1, 1)] < 0.0 || q[(2, 2)] < 0.0 {
            q = -q;
        }
        let q = enforce_rank3(&q);

        let mut focal_lengths = Vec::with_capacity(cameras.len());
        for p in cameras {
            let w = p * q * p.transpose();
            if w[(2, 2)] <= 0.0 {
                return Err(GeometryError::Degenerate("image of the quadric is not positive"));
            }
            let w = w / w[(2, 2)];
            let focal = FocalLengths {
                fx: w[(0, 0)].sqrt(),
                fy: w[(1, 1)].sqrt(),
            };
            if !(focal.fx.is_finite() && focal.fy.is_finite() && focal.fx > 0.0 && focal.fy > 0.0) {
                return Err(GeometryError::Degenerate("invalid focal length"));
            }
            focal_lengths.push(focal);
        }

        Ok(DualQuadricSolution { q, focal_lengths })
    }
}

fn enforce_rank3(q: &Matrix4<f64>) -> Matrix4<f64> {
    let eigen = q.symmetric_eigen();
    let mut values = eigen.eigenvalues;
    let mut smallest = 0;
    for i in 1..4 {
        if values[i].abs() < values[smallest].abs() {
            smallest = i;
        }
    }
    values[smallest] = 0.0;
    eigen.eigenvectors * Matrix4::from_diagonal(&values) * eigen.eigenvectors.transpose()
}

/// The projective to metric upgrade `H = [[K1, 0], [-vᵀ K1, 1]]`.
///
/// `v` describes the plane at infinity `(vᵀ, 1)` and `K1` the calibration of the first view.
pub fn projective_to_metric_h(k1: &Matrix3<f64>, v: &Vector3<f64>) -> Matrix4<f64> {
    let mut h = Matrix4::zeros();
    h.fixed_view_mut::<3, 3>(0, 0).copy_from(k1);
    let bottom = -(v.transpose() * k1);
    h.fixed_view_mut::<1, 3>(3, 0).copy_from(&bottom);
    h[(3, 3)] = 1.0;
    h
}

/// Decompose a dual absolute quadric into the projective to metric upgrade.
pub fn absolute_quadratic_to_h(q: &Matrix4<f64>) -> Result<Matrix4<f64>, GeometryError> {
    if q[(2, 2)].abs() < 1e-300 {
        return Err(GeometryError::Degenerate("quadric has a vanishing diagonal"));
    }
    let q = q / q[(2, 2)];
    let w: Matrix3<f64> = q.fixed_view::<3, 3>(0, 0).into_owned();
    let w_inv = w
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular absolute conic"))?;
    let chol = Cholesky::new(w_inv).ok_or(GeometryError::Degenerate(
        "absolute conic is not positive definite",
    ))?;
    // w⁻¹ = L Lᵀ, hence w = K Kᵀ with the upper triangular K = L⁻ᵀ
    let l_inv = chol
        .l()
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular cholesky factor"))?;
    let k1 = l_inv.transpose();
    let v = -(w_inv * q.fixed_view::<3, 1>(0, 3));
    Ok(projective_to_metric_h(&k1, &v))
}

/// Both solutions for the plane at infinity of a projective pair `[I | 0]`, `p2`
/// with known calibrations.
///
/// Each candidate `v` makes `p2 H` a calibrated camera for `H` from
/// [`projective_to_metric_h`]. They differ by a half turn of the second camera
/// about the baseline, so callers pick the one with positive depths.
pub fn plane_at_infinity_given_k(
    p2: &Matrix3x4<f64>,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
) -> Result<[Vector3<f64>; 2], GeometryError> {
    let k2_inv = k2
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular calibration"))?;
    let a: Matrix3<f64> = p2.fixed_view::<3, 3>(0, 0).into_owned();
    let b_mat = k2_inv * a * k1;
    let b = k2_inv * p2.column(3);
    let b_norm = b.norm();
    if b_norm < 1e-12 {
        return Err(GeometryError::Degenerate("no baseline between the views"));
    }

    // rotation taking b onto the x axis
    let e1 = b / b_norm;
    let helper = if e1.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let e2 = e1.cross(&helper).normalize();
    let e3 = e1.cross(&e2);
    let rb = Matrix3::from_rows(&[e1.transpose(), e2.transpose(), e3.transpose()]);

    let rotated = rb * b_mat;
    let row1: Vector3<f64> = rotated.row(0).transpose();
    let row2: Vector3<f64> = rotated.row(1).transpose();
    let row3: Vector3<f64> = rotated.row(2).transpose();
    let mu = 0.5 * (row2.norm() + row3.norm());
    if mu < 1e-12 {
        return Err(GeometryError::Degenerate("camera matrix has a rank deficient block"));
    }
    let r1 = (row2 / mu).cross(&(row3 / mu));

    let k1_inv_t = k1
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular calibration"))?
        .transpose();
    let w_plus = (row1 - r1 * mu) / b_norm;
    let w_minus = (row1 + r1 * mu) / b_norm;
    Ok([k1_inv_t * w_plus, k1_inv_t * w_minus])
}
