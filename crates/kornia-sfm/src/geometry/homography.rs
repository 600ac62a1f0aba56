use nalgebra::{DMatrix, Matrix3, Vector2};

use crate::error::GeometryError;
use crate::geometry::linalg::{normalize_points_2d, null_vector};
use crate::geometry::ransac::RansacEstimator;
use crate::geometry::AssociatedPair;

/// Estimate the homography `x2 ~ H x1` with the normalized DLT.
pub fn homography_dlt(pairs: &[AssociatedPair]) -> Result<Matrix3<f64>, GeometryError> {
    if pairs.len() < 4 {
        return Err(GeometryError::InsufficientCorrespondences {
            required: 4,
            actual: pairs.len(),
        });
    }

    let x1: Vec<Vector2<f64>> = pairs.iter().map(|p| p.p1).collect();
    let x2: Vec<Vector2<f64>> = pairs.iter().map(|p| p.p2).collect();
    let (x1n, t1) = normalize_points_2d(&x1);
    let (x2n, t2) = normalize_points_2d(&x2);

    let mut a = DMatrix::<f64>::zeros(2 * pairs.len(), 9);
    for (i, (p, q)) in x1n.iter().zip(x2n.iter()).enumerate() {
        let r0 = [-p.x, -p.y, -1.0, 0.0, 0.0, 0.0, q.x * p.x, q.x * p.y, q.x];
        let r1 = [0.0, 0.0, 0.0, -p.x, -p.y, -1.0, q.y * p.x, q.y * p.y, q.y];
        for j in 0..9 {
            a[(2 * i, j)] = r0[j];
            a[(2 * i + 1, j)] = r1[j];
        }
    }

    let (h, _) = null_vector(&a);
    let hn = Matrix3::from_row_slice(h.as_slice());
    let t2_inv = t2
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular normalization"))?;
    let h = t2_inv * hn * t1;
    let norm = h.norm();
    if norm < 1e-300 || !norm.is_finite() {
        return Err(GeometryError::Degenerate("homography vanished"));
    }
    Ok(h / norm)
}

/// Squared transfer error of `x1` mapped into the second image.
pub fn transfer_error(h: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let p = h * x1.push(1.0);
    if p.z.abs() < f64::EPSILON {
        return f64::INFINITY;
    }
    (Vector2::new(p.x / p.z, p.y / p.z) - x2).norm_squared()
}

/// Homography model for [`crate::geometry::ransac::ransac`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HomographyEstimator;

impl RansacEstimator for HomographyEstimator {
    type Datum = AssociatedPair;
    type Model = Matrix3<f64>;

    fn sample_size(&self) -> usize {
        4
    }

    fn fit(&self, sample: &[AssociatedPair]) -> Option<Matrix3<f64>> {
        homography_dlt(sample).ok()
    }

    fn error(&self, model: &Matrix3<f64>, datum: &AssociatedPair) -> f64 {
        transfer_error(model, &datum.p1, &datum.p2)
    }
}
