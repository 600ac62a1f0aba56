use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};

use crate::error::GeometryError;
use crate::geometry::linalg::{normalize_points_2d, null_vector, svd3};
use crate::geometry::ransac::RansacEstimator;
use crate::geometry::AssociatedPair;

/// Estimate the fundamental matrix using the normalized 8-point algorithm.
///
/// The result satisfies `x2ᵀ F x1 = 0` and has rank 2.
pub fn fundamental_8point(pairs: &[AssociatedPair]) -> Result<Matrix3<f64>, GeometryError> {
    if pairs.len() < 8 {
        return Err(GeometryError::InsufficientCorrespondences {
            required: 8,
            actual: pairs.len(),
        });
    }

    let x1: Vec<Vector2<f64>> = pairs.iter().map(|p| p.p1).collect();
    let x2: Vec<Vector2<f64>> = pairs.iter().map(|p| p.p2).collect();
    let (x1n, t1) = normalize_points_2d(&x1);
    let (x2n, t2) = normalize_points_2d(&x2);

    // Build design matrix A (N x 9) for x2' * F * x1 = 0
    let mut a = DMatrix::<f64>::zeros(pairs.len(), 9);
    for (i, (p, q)) in x1n.iter().zip(x2n.iter()).enumerate() {
        let row = [
            q.x * p.x,
            q.x * p.y,
            q.x,
            q.y * p.x,
            q.y * p.y,
            q.y,
            p.x,
            p.y,
            1.0,
        ];
        for (j, v) in row.iter().enumerate() {
            a[(i, j)] = *v;
        }
    }

    let (f, _) = null_vector(&a);
    let f = Matrix3::from_row_slice(f.as_slice());

    // Enforce rank-2 by zeroing the smallest singular value
    let (u, mut s, v) = svd3(&f);
    s[2] = 0.0;
    let f_rank2 = u * Matrix3::from_diagonal(&s) * v.transpose();

    let f = t2.transpose() * f_rank2 * t1;
    let norm = f.norm();
    if norm < 1e-300 || !norm.is_finite() {
        return Err(GeometryError::Degenerate("fundamental matrix vanished"));
    }
    Ok(f / norm)
}

/// Sampson approximation of the squared geometric error of a correspondence.
pub fn sampson_distance(f: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let p1 = Vector3::new(x1.x, x1.y, 1.0);
    let p2 = Vector3::new(x2.x, x2.y, 1.0);
    let fx1 = f * p1;
    let ftx2 = f.transpose() * p2;
    let x2tfx1 = p2.dot(&fx1);
    let denom = fx1.x * fx1.x + fx1.y * fx1.y + ftx2.x * ftx2.x + ftx2.y * ftx2.y;
    if denom <= f64::EPSILON {
        return f64::INFINITY;
    }
    x2tfx1 * x2tfx1 / denom
}

/// Fundamental matrix model for [`crate::geometry::ransac::ransac`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FundamentalEstimator;

impl RansacEstimator for FundamentalEstimator {
    type Datum = AssociatedPair;
    type Model = Matrix3<f64>;

    fn sample_size(&self) -> usize {
        8
    }

    fn fit(&self, sample: &[AssociatedPair]) -> Option<Matrix3<f64>> {
        fundamental_8point(sample).ok()
    }

    fn error(&self, model: &Matrix3<f64>, datum: &AssociatedPair) -> f64 {
        sampson_distance(model, &datum.p1, &datum.p2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::se3::Se3;
    use crate::synthetic;
    use approx::assert_relative_eq;

    #[test]
    fn test_fundamental_8point_epipolar_constraint() -> Result<(), GeometryError> {
        let k = synthetic::k_matrix(500.0);
        let points = synthetic::random_points(30, 7);
        let pose = Se3::from_rodrigues(&Vector3::new(0.05, -0.2, 0.02), Vector3::new(-1.0, 0.1, 0.2));
        let pairs: Vec<AssociatedPair> = points
            .iter()
            .map(|p| {
                let c1 = p + Vector3::new(0.0, 0.0, 5.0);
                let c2 = pose.transform(&c1);
                AssociatedPair::new(synthetic::project(&k, &c1), synthetic::project(&k, &c2))
            })
            .collect();

        let f = fundamental_8point(&pairs)?;
        for pair in &pairs {
            assert!(sampson_distance(&f, &pair.p1, &pair.p2) < 1e-10);
        }
        assert_relative_eq!(f.determinant(), 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_fundamental_8point_too_few() {
        let pairs = vec![AssociatedPair::new(Vector2::zeros(), Vector2::zeros()); 7];
        assert!(fundamental_8point(&pairs).is_err());
    }
}
