use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};

use crate::error::GeometryError;
use crate::geometry::linalg::{normalize_points_2d, null_vector, skew, svd3};
use crate::geometry::ransac::RansacEstimator;
use crate::geometry::triangulate::triangulate_projective;
use crate::geometry::AssociatedTriple;

/// Trifocal tensor stored as its three correlation slices `T_i`.
///
/// With `P1 = [I | 0]`, `P2 = [A | a4]` and `P3 = [B | b4]` the slices are
/// `T_i = a_i b4ᵀ - a4 b_iᵀ`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrifocalTensor {
    /// The slices `T_1`, `T_2`, `T_3`.
    pub t: [Matrix3<f64>; 3],
}

impl TrifocalTensor {
    /// Tensor induced by the canonical camera triple `[I | 0]`, `p2`, `p3`.
    pub fn from_cameras(p2: &Matrix3x4<f64>, p3: &Matrix3x4<f64>) -> Self {
        let a4: Vector3<f64> = p2.column(3).into_owned();
        let b4: Vector3<f64> = p3.column(3).into_owned();
        let slice = |i: usize| {
            let ai: Vector3<f64> = p2.column(i).into_owned();
            let bi: Vector3<f64> = p3.column(i).into_owned();
            ai * b4.transpose() - a4 * bi.transpose()
        };
        Self {
            t: [slice(0), slice(1), slice(2)],
        }
    }

    /// Unit norm epipoles of the first camera center in views two and three.
    pub fn epipoles(&self) -> (Vector3<f64>, Vector3<f64>) {
        let mut left = Matrix3::zeros();
        let mut right = Matrix3::zeros();
        for (i, ti) in self.t.iter().enumerate() {
            let (u, _, v) = svd3(ti);
            left.set_row(i, &u.column(2).transpose());
            right.set_row(i, &v.column(2).transpose());
        }
        let (_, _, vl) = svd3(&left);
        let (_, _, vr) = svd3(&right);
        (vl.column(2).into_owned(), vr.column(2).into_owned())
    }

    /// Camera matrices of views two and three in the frame where `P1 = [I | 0]`.
    pub fn extract_cameras(&self) -> (Matrix3x4<f64>, Matrix3x4<f64>) {
        let (e2, e3) = self.epipoles();
        let reject = e3 * e3.transpose() - Matrix3::identity();

        let mut p2 = Matrix3x4::zeros();
        let mut p3 = Matrix3x4::zeros();
        for (i, ti) in self.t.iter().enumerate() {
            p2.set_column(i, &(ti * e3));
            p3.set_column(i, &(reject * ti.transpose() * e2));
        }
        p2.set_column(3, &e2);
        p3.set_column(3, &e3);
        (p2, p3)
    }
}

/// Trifocal tensor together with the camera matrices it was extracted into.
#[derive(Clone, Copy, Debug)]
pub struct TrifocalCameras {
    /// The tensor, for pixel coordinates.
    pub tensor: TrifocalTensor,
    /// Camera matrix of the second view. The first is `[I | 0]`.
    pub p2: Matrix3x4<f64>,
    /// Camera matrix of the third view.
    pub p3: Matrix3x4<f64>,
}

impl TrifocalCameras {
    /// All three camera matrices.
    pub fn cameras(&self) -> [Matrix3x4<f64>; 3] {
        [Matrix3x4::identity(), self.p2, self.p3]
    }

    /// Sum of the squared reprojection errors of a triple after triangulation.
    pub fn reprojection_error(&self, triple: &AssociatedTriple) -> f64 {
        let cameras = self.cameras();
        let pixels = [triple.p1, triple.p2, triple.p3];
        let Some(x) = triangulate_projective(&pixels, &cameras) else {
            return f64::INFINITY;
        };
        let mut error = 0.0;
        for (p, pixel) in cameras.iter().zip(pixels.iter()) {
            let h = p * x;
            if h.z.abs() < 1e-12 {
                return f64::INFINITY;
            }
            error += (Vector2::new(h.x / h.z, h.y / h.z) - pixel).norm_squared();
        }
        error
    }
}

fn expand(n: &Matrix3<f64>) -> Matrix4<f64> {
    let mut g = Matrix4::identity();
    g.fixed_view_mut::<3, 3>(0, 0).copy_from(n);
    g
}

/// Linear estimate of the trifocal tensor and its cameras from seven or more triples.
///
/// Each view is Hartley-normalized, the tensor is the least squares solution of
/// `[x']x (Σ x^i T_i) [x'']x = 0`, and the extracted cameras are mapped back to
/// pixel coordinates keeping `P1 = [I | 0]`.
pub fn trifocal_linear(triples: &[AssociatedTriple]) -> Result<TrifocalCameras, GeometryError> {
    if triples.len() < 7 {
        return Err(GeometryError::InsufficientCorrespondences {
            required: 7,
            actual: triples.len(),
        });
    }

    let x1: Vec<Vector2<f64>> = triples.iter().map(|t| t.p1).collect();
    let x2: Vec<Vector2<f64>> = triples.iter().map(|t| t.p2).collect();
    let x3: Vec<Vector2<f64>> = triples.iter().map(|t| t.p3).collect();
    let (x1n, n1) = normalize_points_2d(&x1);
    let (x2n, n2) = normalize_points_2d(&x2);
    let (x3n, n3) = normalize_points_2d(&x3);

    let mut a = DMatrix::<f64>::zeros(4 * triples.len(), 27);
    for k in 0..triples.len() {
        let x = x1n[k].push(1.0);
        let s2 = skew(&x2n[k].push(1.0));
        let s3 = skew(&x3n[k].push(1.0));
        for s in 0..2 {
            for t in 0..2 {
                let row = 4 * k + 2 * s + t;
                for i in 0..3 {
                    for q in 0..3 {
                        for r in 0..3 {
                            a[(row, 9 * i + 3 * q + r)] = x[i] * s2[(s, q)] * s3[(r, t)];
                        }
                    }
                }
            }
        }
    }

    let (solution, _) = null_vector(&a);
    let slice = |i: usize| Matrix3::from_row_slice(&solution.as_slice()[9 * i..9 * i + 9]);
    let normalized = TrifocalTensor {
        t: [slice(0), slice(1), slice(2)],
    };
    let (p2n, p3n) = normalized.extract_cameras();

    let g = expand(&n1);
    let n2_inv = n2
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular normalization"))?;
    let n3_inv = n3
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular normalization"))?;
    let p2 = n2_inv * p2n * g;
    let p3 = n3_inv * p3n * g;

    let scale = p2.norm().max(p3.norm());
    if scale < 1e-300 || !scale.is_finite() {
        return Err(GeometryError::Degenerate("trifocal cameras vanished"));
    }
    let (p2, p3) = (p2 / scale, p3 / scale);
    Ok(TrifocalCameras {
        tensor: TrifocalTensor::from_cameras(&p2, &p3),
        p2,
        p3,
    })
}

/// Trifocal model for [`crate::geometry::ransac::ransac`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TrifocalEstimator;

impl RansacEstimator for TrifocalEstimator {
    type Datum = AssociatedTriple;
    type Model = TrifocalCameras;

    fn sample_size(&self) -> usize {
        7
    }

    fn fit(&self, sample: &[AssociatedTriple]) -> Option<TrifocalCameras> {
        trifocal_linear(sample).ok()
    }

    fn error(&self, model: &TrifocalCameras, datum: &AssociatedTriple) -> f64 {
        model.reprojection_error(datum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigRansac;
    use crate::geometry::ransac::ransac;
    use crate::synthetic;

    fn synthetic_triples(n: usize, seed: u64) -> Vec<AssociatedTriple> {
        let scene = synthetic::orbit_scene(3, n, seed);
        (0..n)
            .map(|i| AssociatedTriple::new(scene.pixels[0][i], scene.pixels[1][i], scene.pixels[2][i]))
            .collect()
    }

    #[test]
    fn test_from_cameras_satisfies_incidence() {
        let scene = synthetic::orbit_scene(3, 10, 1);
        let cameras: Vec<Matrix3x4<f64>> = scene.projective_cameras();
        let tensor = TrifocalTensor::from_cameras(&cameras[1], &cameras[2]);
        for i in 0..10 {
            let x = scene.pixels[0][i].push(1.0);
            let sum = tensor.t[0] * x[0] + tensor.t[1] * x[1] + tensor.t[2] * x[2];
            let m = skew(&scene.pixels[1][i].push(1.0)) * sum * skew(&scene.pixels[2][i].push(1.0));
            assert!(m.norm() / (sum.norm() + 1.0) < 1e-6);
        }
    }

    #[test]
    fn test_trifocal_linear_exact() -> Result<(), GeometryError> {
        let triples = synthetic_triples(25, 2);
        let model = trifocal_linear(&triples)?;
        for triple in &triples {
            assert!(model.reprojection_error(triple) < 1e-8);
        }
        assert_eq!(model.cameras()[0], Matrix3x4::identity());
        Ok(())
    }

    #[test]
    fn test_trifocal_ransac_with_outliers() -> Result<(), GeometryError> {
        let mut triples = synthetic_triples(60, 3);
        for (i, triple) in triples.iter_mut().enumerate().take(10) {
            triple.p3 += Vector2::new(25.0 + i as f64, -40.0);
        }
        let params = ConfigRansac::default().with_inlier_threshold(1.0);
        let result = ransac(&TrifocalEstimator, &triples, &params)?;
        assert_eq!(result.inliers, (10..60).collect::<Vec<_>>());
        Ok(())
    }
}
