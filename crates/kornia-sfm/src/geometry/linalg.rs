use nalgebra::{DMatrix, DVector, Matrix3, Matrix4, Vector2, Vector3, Vector4};

fn to_faer(a: &DMatrix<f64>) -> faer::Mat<f64> {
    let mut m = faer::Mat::<f64>::zeros(a.nrows(), a.ncols());
    for i in 0..a.nrows() {
        for j in 0..a.ncols() {
            m.write(i, j, a[(i, j)]);
        }
    }
    m
}

/// Solve `A x = 0` in the least squares sense with `|x| = 1`.
///
/// Returns the right singular vector of the smallest singular value together
/// with the singular values in non-increasing order.
pub fn null_vector(a: &DMatrix<f64>) -> (DVector<f64>, Vec<f64>) {
    let n = a.ncols();
    let m = to_faer(a);
    // a thin decomposition keeps the whole right basis only for tall matrices
    if a.nrows() >= n {
        let svd = m.thin_svd();
        last_right_vector(svd.v(), svd.s_diagonal())
    } else {
        let svd = m.svd();
        last_right_vector(svd.v(), svd.s_diagonal())
    }
}

fn last_right_vector(v: faer::MatRef<'_, f64>, s: faer::ColRef<'_, f64>) -> (DVector<f64>, Vec<f64>) {
    let n = v.nrows();
    let x = DVector::from_fn(n, |i, _| v.read(i, n - 1));
    let singular_values = (0..s.nrows()).map(|i| s.read(i)).collect();
    (x, singular_values)
}

/// Full singular value decomposition `M = U diag(s) Vᵀ` of a 3x3 matrix.
///
/// Singular values are sorted in non-increasing order.
pub fn svd3(m: &Matrix3<f64>) -> (Matrix3<f64>, Vector3<f64>, Matrix3<f64>) {
    let fm = to_faer(&DMatrix::from_fn(3, 3, |i, j| m[(i, j)]));
    let svd = fm.svd();
    let (u, v, s) = (svd.u(), svd.v(), svd.s_diagonal());
    (
        Matrix3::from_fn(|i, j| u.read(i, j)),
        Vector3::new(s.read(0), s.read(1), s.read(2)),
        Matrix3::from_fn(|i, j| v.read(i, j)),
    )
}

/// Cross product matrix `[v]x` such that `[v]x w = v x w`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// RQ decomposition `M = K R` with `K` upper triangular with a non-negative
/// diagonal and `R` orthogonal.
pub fn rq3(m: &Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    // reversing rows turns QR of (P M)ᵀ into RQ of M
    let flip = Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
    let qr = (flip * m).transpose().qr();
    let (q, r) = (qr.q(), qr.r());
    let mut k = flip * r.transpose() * flip;
    let mut rot = flip * q.transpose();
    for i in 0..3 {
        if k[(i, i)] < 0.0 {
            k.column_mut(i).neg_mut();
            rot.row_mut(i).neg_mut();
        }
    }
    (k, rot)
}

/// Hartley normalization: zero mean and an average distance of √2 to the origin.
///
/// Returns the normalized points and the similarity `T` with `x_n = T x`.
pub fn normalize_points_2d(points: &[Vector2<f64>]) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let n = points.len().max(1) as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - mean).norm()).sum::<f64>() / n;
    let scale = if mean_dist > 0.0 {
        2.0f64.sqrt() / mean_dist
    } else {
        1.0
    };

    let normalized = points.iter().map(|p| (p - mean) * scale).collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -scale * mean.x,
        0.0,
        scale,
        -scale * mean.y,
        0.0,
        0.0,
        1.0,
    );
    (normalized, t)
}

/// Eigenvector of the smallest eigenvalue of a symmetric 4x4 matrix.
pub fn smallest_eigenvector4(m: &Matrix4<f64>) -> Vector4<f64> {
    let eigen = m.symmetric_eigen();
    let mut best = 0;
    for i in 1..4 {
        if eigen.eigenvalues[i] < eigen.eigenvalues[best] {
            best = i;
        }
    }
    eigen.eigenvectors.column(best).into_owned()
}

/// Median of a slice, reordering it in place.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    Some(values[values.len() / 2])
}
