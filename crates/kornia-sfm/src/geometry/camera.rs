use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::GeometryError;
use crate::geometry::linalg::rq3;
use crate::geometry::se3::Se3;
use crate::lookup::ImageShape;

const MIN_DEPTH: f64 = 1e-12;

/// Pinhole intrinsics with skew.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    /// Focal length along x, in pixels.
    pub fx: f64,
    /// Focal length along y, in pixels.
    pub fy: f64,
    /// Skew.
    pub skew: f64,
    /// Principal point x, in pixels.
    pub cx: f64,
    /// Principal point y, in pixels.
    pub cy: f64,
}

impl PinholeCamera {
    /// Create intrinsics from their parameters.
    pub fn new(fx: f64, fy: f64, skew: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            skew,
            cx,
            cy,
        }
    }

    /// Intrinsics with a single focal length and the principal point at the origin.
    pub fn from_focal(f: f64) -> Self {
        Self::new(f, f, 0.0, 0.0, 0.0)
    }

    /// Intrinsics from an upper triangular calibration matrix.
    pub fn from_k(k: &Matrix3<f64>) -> Self {
        let k = k / k[(2, 2)];
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 1)], k[(0, 2)], k[(1, 2)])
    }

    /// The calibration matrix `K`.
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0,
        )
    }

    /// The same intrinsics for pixel coordinates whose origin is the image center.
    pub fn centered(&self, shape: &ImageShape) -> Self {
        let c = shape.center();
        Self::new(self.fx, self.fy, self.skew, self.cx - c.x, self.cy - c.y)
    }

    /// Mean of both focal lengths.
    pub fn mean_focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    /// Convert a pixel into normalized image coordinates.
    pub fn pixel_to_norm(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        Vector2::new(x, y)
    }

    /// Convert normalized image coordinates into a pixel.
    pub fn norm_to_pixel(&self, norm: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * norm.x + self.skew * norm.y + self.cx,
            self.fy * norm.y + self.cy,
        )
    }

    /// Project a point in the camera frame. `None` when the point lies on the image plane.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z.abs() < MIN_DEPTH {
            return None;
        }
        Some(self.norm_to_pixel(&Vector2::new(p.x / p.z, p.y / p.z)))
    }
}

/// Pinhole camera with a single focal length and two radial distortion terms.
///
/// Pixels are relative to the image center: `u = f (1 + k1 r² + k2 r⁴) x / z`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundlePinholeSimplified {
    /// Focal length, in pixels.
    pub f: f64,
    /// Second order radial distortion.
    pub k1: f64,
    /// Fourth order radial distortion.
    pub k2: f64,
}

impl BundlePinholeSimplified {
    /// Camera without distortion.
    pub fn new(f: f64) -> Self {
        Self {
            f,
            k1: 0.0,
            k2: 0.0,
        }
    }

    fn distortion(&self, r2: f64) -> f64 {
        1.0 + self.k1 * r2 + self.k2 * r2 * r2
    }

    /// Project a point in the camera frame.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z.abs() < MIN_DEPTH {
            return None;
        }
        let (x, y) = (p.x / p.z, p.y / p.z);
        let scale = self.f * self.distortion(x * x + y * y);
        Some(Vector2::new(scale * x, scale * y))
    }

    /// Convert a pixel into normalized image coordinates, undoing the distortion iteratively.
    pub fn pixel_to_norm(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let distorted = pixel / self.f;
        let mut norm = distorted;
        for _ in 0..10 {
            norm = distorted / self.distortion(norm.norm_squared());
        }
        norm
    }
}

/// Camera model optimized by bundle adjustment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BundleCamera {
    /// Pinhole intrinsics, never optimized.
    Pinhole(PinholeCamera),
    /// Focal length and radial distortion.
    Simplified(BundlePinholeSimplified),
}

impl BundleCamera {
    /// Project a point in the camera frame.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        match self {
            BundleCamera::Pinhole(camera) => camera.project(p),
            BundleCamera::Simplified(camera) => camera.project(p),
        }
    }

    /// Convert a pixel into normalized image coordinates.
    pub fn pixel_to_norm(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        match self {
            BundleCamera::Pinhole(camera) => camera.pixel_to_norm(pixel),
            BundleCamera::Simplified(camera) => camera.pixel_to_norm(pixel),
        }
    }

    /// Number of parameters exposed to the optimizer.
    pub fn parameter_count(&self) -> usize {
        match self {
            BundleCamera::Pinhole(_) => 0,
            BundleCamera::Simplified(_) => 3,
        }
    }

    /// Optimizable parameters.
    pub fn parameters(&self) -> Vec<f64> {
        match self {
            BundleCamera::Pinhole(_) => Vec::new(),
            BundleCamera::Simplified(camera) => vec![camera.f, camera.k1, camera.k2],
        }
    }

    /// Overwrite the optimizable parameters.
    pub fn set_parameters(&mut self, params: &[f64]) {
        if let (BundleCamera::Simplified(camera), [f, k1, k2]) = (self, params) {
            camera.f = *f;
            camera.k1 = *k1;
            camera.k2 = *k2;
        }
    }
}

/// Decompose a finite camera matrix `P = λ K [R | t]`.
///
/// The sign of `P` is chosen so that `det(R) = +1`, and `K` is scaled to `K[2][2] = 1`.
pub fn decompose_camera_matrix(p: &Matrix3x4<f64>) -> Result<(Matrix3<f64>, Se3), GeometryError> {
    let mut p = *p;
    let mut m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
    let det = m.determinant();
    if det.abs() < 1e-14 || !det.is_finite() {
        return Err(GeometryError::Degenerate("camera matrix has a singular left block"));
    }
    if det < 0.0 {
        p = -p;
        m = -m;
    }

    let (k_raw, rotation) = rq3(&m);
    let k_inv = k_raw
        .try_inverse()
        .ok_or(GeometryError::Degenerate("singular calibration matrix"))?;
    let translation = k_inv * p.column(3);
    let k = k_raw / k_raw[(2, 2)];
    Ok((k, Se3::new(rotation, translation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pinhole_roundtrip() {
        let camera = PinholeCamera::new(500.0, 480.0, 0.5, 320.0, 240.0);
        let norm = Vector2::new(0.12, -0.3);
        assert_relative_eq!(camera.pixel_to_norm(&camera.norm_to_pixel(&norm)), norm, epsilon = 1e-12);

        let centered = camera.centered(&ImageShape::new(640, 480));
        assert_relative_eq!(centered.cx, 0.0);
        assert_relative_eq!(centered.cy, 0.0);
        assert_relative_eq!(PinholeCamera::from_k(&camera.k_matrix()).fx, 500.0);
        assert!(camera.project(&Vector3::new(1.0, 1.0, 0.0)).is_none());
    }

    #[test]
    fn test_simplified_undistort() {
        let camera = BundlePinholeSimplified {
            f: 400.0,
            k1: 0.01,
            k2: -0.002,
        };
        let p = Vector3::new(0.3, -0.2, 2.0);
        let pixel = camera.project(&p).expect("point in front of the camera");
        assert_relative_eq!(camera.pixel_to_norm(&pixel), Vector2::new(0.15, -0.1), epsilon = 1e-9);

        let mut bundle = BundleCamera::Simplified(camera);
        bundle.set_parameters(&[300.0, 0.0, 0.0]);
        assert_eq!(bundle.parameters(), vec![300.0, 0.0, 0.0]);
        assert_eq!(BundleCamera::Pinhole(PinholeCamera::from_focal(1.0)).parameter_count(), 0);
    }

    #[test]
    fn test_decompose_camera_matrix() -> Result<(), GeometryError> {
        let k = Matrix3::new(450.0, 0.0, 12.0, 0.0, 440.0, -8.0, 0.0, 0.0, 1.0);
        let pose = Se3::from_rodrigues(&Vector3::new(0.2, -0.1, 0.05), Vector3::new(0.5, -1.0, 3.0));
        // negative scale exercises the sign fix
        let p = -2.5 * k * pose.to_matrix();

        let (k_est, pose_est) = decompose_camera_matrix(&p)?;
        assert_relative_eq!(k_est, k, epsilon = 1e-8);
        assert_relative_eq!(pose_est.rotation, pose.rotation, epsilon = 1e-10);
        assert_relative_eq!(pose_est.translation, pose.translation, epsilon = 1e-9);
        Ok(())
    }
}
