use nalgebra::{Matrix3, Vector3};

use crate::geometry::linalg::svd3;
use crate::geometry::se3::Se3;
use crate::geometry::triangulate::triangulate_two_view;
use crate::geometry::AssociatedPair;

/// Essential matrix `E = K2ᵀ F K1` from a fundamental matrix and both calibrations.
pub fn essential_from_fundamental(
    f: &Matrix3<f64>,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
) -> Matrix3<f64> {
    k2.transpose() * f * k1
}

/// The four `(R, t)` candidates of an essential matrix, with `|t| = 1`.
pub fn decompose_essential(e: &Matrix3<f64>) -> [Se3; 4] {
    let (mut u, _, mut v) = svd3(e);
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v.determinant() < 0.0 {
        v.column_mut(2).neg_mut();
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v.transpose();
    let r2 = u * w.transpose() * v.transpose();
    let t: Vector3<f64> = u.column(2).into_owned();

    [
        Se3::new(r1, t),
        Se3::new(r1, -t),
        Se3::new(r2, t),
        Se3::new(r2, -t),
    ]
}

/// Pick the candidate of `E` placing the most normalized correspondences in front of both views.
///
/// Returns the view 1 to view 2 transform and the number of points in front.
pub fn select_essential_pose(e: &Matrix3<f64>, pairs: &[AssociatedPair]) -> (Se3, usize) {
    let mut best = (Se3::identity(), 0usize);
    for (i, candidate) in decompose_essential(e).iter().enumerate() {
        let count = pairs
            .iter()
            .filter(|pair| {
                triangulate_two_view(&pair.p1, &pair.p2, candidate)
                    .map(|x| x.z > 0.0 && candidate.transform(&x).z > 0.0)
                    .unwrap_or(false)
            })
            .count();
        if i == 0 || count > best.1 {
            best = (*candidate, count);
        }
    }
    best
}
