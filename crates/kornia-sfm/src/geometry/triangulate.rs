use nalgebra::{Matrix3x4, Matrix4, RowVector4, Vector2, Vector3, Vector4};

use crate::geometry::camera::PinholeCamera;
use crate::geometry::linalg::smallest_eigenvector4;
use crate::geometry::se3::Se3;

fn accumulate_dlt_rows(ata: &mut Matrix4<f64>, x: &Vector2<f64>, p: &Matrix3x4<f64>) {
    let p0: RowVector4<f64> = p.row(0).into_owned();
    let p1: RowVector4<f64> = p.row(1).into_owned();
    let p2: RowVector4<f64> = p.row(2).into_owned();
    for row in [p2 * x.x - p0, p2 * x.y - p1] {
        let norm = row.norm();
        if norm > 0.0 {
            let row = row / norm;
            *ata += row.transpose() * row;
        }
    }
}

/// Triangulate a homogeneous point seen by any number of projective cameras.
///
/// The result has unit norm and a non-negative last coordinate.
pub fn triangulate_projective(
    pixels: &[Vector2<f64>],
    cameras: &[Matrix3x4<f64>],
) -> Option<Vector4<f64>> {
    if pixels.len() < 2 || pixels.len() != cameras.len() {
        return None;
    }
    let mut ata = Matrix4::zeros();
    for (x, p) in pixels.iter().zip(cameras) {
        accumulate_dlt_rows(&mut ata, x, p);
    }
    let mut h = smallest_eigenvector4(&ata);
    if !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    if h.w < 0.0 {
        h = -h;
    }
    Some(h.normalize())
}

/// Triangulate a point from normalized observations and world to view transforms.
pub fn triangulate_metric(norms: &[Vector2<f64>], world_to_view: &[Se3]) -> Option<Vector3<f64>> {
    let cameras: Vec<Matrix3x4<f64>> = world_to_view.iter().map(Se3::to_matrix).collect();
    let h = triangulate_projective(norms, &cameras)?;
    if h.w.abs() < 1e-12 {
        return None;
    }
    Some(h.xyz() / h.w)
}

/// Triangulate a point in the frame of view `a` from two normalized observations.
pub fn triangulate_two_view(
    norm_a: &Vector2<f64>,
    norm_b: &Vector2<f64>,
    a_to_b: &Se3,
) -> Option<Vector3<f64>> {
    triangulate_metric(&[*norm_a, *norm_b], &[Se3::identity(), *a_to_b])
}

/// Angle between the two viewing rays of a correspondence, in radians.
pub fn triangulation_angle(norm_a: &Vector2<f64>, norm_b: &Vector2<f64>, a_to_b: &Se3) -> f64 {
    let ray_a = a_to_b.rotation * Vector3::new(norm_a.x, norm_a.y, 1.0);
    let ray_b = Vector3::new(norm_b.x, norm_b.y, 1.0);
    let cos = ray_a.dot(&ray_b) / (ray_a.norm() * ray_b.norm());
    cos.clamp(-1.0, 1.0).acos()
}

/// Sum of the squared pixel errors of a point given in the frame of view `a`.
///
/// Returns infinity when the point cannot be projected in either view.
pub fn reprojection_error_two_view(
    camera_a: &PinholeCamera,
    camera_b: &PinholeCamera,
    pixel_a: &Vector2<f64>,
    pixel_b: &Vector2<f64>,
    a_to_b: &Se3,
    point_a: &Vector3<f64>,
) -> f64 {
    let projected_a = camera_a.project(point_a);
    let projected_b = camera_b.project(&a_to_b.transform(point_a));
    match (projected_a, projected_b) {
        (Some(pa), Some(pb)) => (pa - pixel_a).norm_squared() + (pb - pixel_b).norm_squared(),
        _ => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_two_view_roundtrip() {
        let camera = PinholeCamera::from_focal(600.0);
        let a_to_b = Se3::from_rodrigues(&Vector3::new(0.02, -0.15, 0.01), Vector3::new(-0.9, 0.05, 0.1));
        let point = Vector3::new(0.4, -0.3, 4.0);
        let in_b = a_to_b.transform(&point);
        let pixel_a = camera.project(&point).expect("visible in a");
        let pixel_b = camera.project(&in_b).expect("visible in b");

        let x = triangulate_two_view(
            &camera.pixel_to_norm(&pixel_a),
            &camera.pixel_to_norm(&pixel_b),
            &a_to_b,
        )
        .expect("triangulation");
        assert_relative_eq!(x, point, epsilon = 1e-9);
        let error = reprojection_error_two_view(&camera, &camera, &pixel_a, &pixel_b, &a_to_b, &x);
        assert!(error < 1e-14);
    }

    #[test]
    fn test_projective_n_view() {
        let point = Vector4::new(0.2, 0.5, 3.0, 1.0);
        let cameras = [
            Se3::identity().to_matrix(),
            Se3::from_rodrigues(&Vector3::new(0.0, 0.2, 0.0), Vector3::new(-1.0, 0.0, 0.0)).to_matrix() * 3.0,
            Se3::from_rodrigues(&Vector3::new(0.1, -0.2, 0.0), Vector3::new(1.0, 0.3, 0.0)).to_matrix(),
        ];
        let pixels: Vec<Vector2<f64>> = cameras
            .iter()
            .map(|p| {
                let x = p * point;
                Vector2::new(x.x / x.z, x.y / x.z)
            })
            .collect();
        let h = triangulate_projective(&pixels, &cameras).expect("triangulation");
        assert_relative_eq!(h.xyz() / h.w, point.xyz(), epsilon = 1e-9);
        assert_relative_eq!(h.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_triangulation_angle() {
        let a_to_b = Se3::new(nalgebra::Matrix3::identity(), Vector3::new(-1.0, 0.0, 0.0));
        // point at (0.5, 0, 0.5) in a is seen at +-45 degrees
        let angle = triangulation_angle(&Vector2::new(1.0, 0.0), &Vector2::new(-1.0, 0.0), &a_to_b);
        assert_relative_eq!(angle, std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
        let zero = triangulation_angle(&Vector2::new(0.1, 0.2), &Vector2::new(0.1, 0.2), &a_to_b);
        assert_relative_eq!(zero, 0.0, epsilon = 1e-7);
    }
}
