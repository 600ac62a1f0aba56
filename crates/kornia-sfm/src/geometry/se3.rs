use nalgebra::{Matrix3, Matrix3x4, Rotation3, UnitQuaternion, Vector3};

/// Rigid body transform `p' = R p + t`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Se3 {
    /// Rotation matrix.
    pub rotation: Matrix3<f64>,
    /// Translation vector.
    pub translation: Vector3<f64>,
}

impl Default for Se3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Se3 {
    /// Create a transform from a rotation matrix and a translation.
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// The identity transform.
    pub fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros())
    }

    /// Create a transform from an axis-angle rotation vector and a translation.
    pub fn from_rodrigues(rvec: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(Rotation3::new(*rvec).into_inner(), translation)
    }

    /// Axis-angle rotation vector of the rotation, with an angle in `[0, π]`.
    ///
    /// Non-finite rotations map to a non-finite vector.
    pub fn rodrigues(&self) -> Vector3<f64> {
        if !self.is_finite() {
            return Vector3::repeat(f64::NAN);
        }
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(self.rotation));
        UnitQuaternion::new_normalize(q.into_inner()).scaled_axis()
    }

    /// Whether every entry of the rotation and the translation is finite.
    pub fn is_finite(&self) -> bool {
        self.rotation.iter().chain(self.translation.iter()).all(|v| v.is_finite())
    }

    /// Apply the transform to a point.
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Apply the inverse transform to a point.
    pub fn transform_reverse(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.transpose() * (p - self.translation)
    }

    /// The inverse transform.
    pub fn inverse(&self) -> Self {
        let rt = self.rotation.transpose();
        Self::new(rt, -(rt * self.translation))
    }

    /// The transform applying `self` first and `other` second.
    pub fn then(&self, other: &Se3) -> Self {
        Self::new(
            other.rotation * self.rotation,
            other.rotation * self.translation + other.translation,
        )
    }

    /// The 3x4 matrix `[R | t]`.
    pub fn to_matrix(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.set_column(3, &self.translation);
        m
    }
}
