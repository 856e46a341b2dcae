//! Packed symmetric metric tensor operations.
//!
//! The metric at a vertex defines the local inner product used for all edge
//! length and quality measurements. Storage is row-major upper triangle:
//! 2D `[m00, m01, m11]`, 3D `[m00, m01, m02, m11, m12, m22]`.

use super::Dim;

/// Apply the packed metric to a vector, `M·v`. The z-component is ignored in
/// 2D and returned as zero.
#[inline]
pub fn metric_apply(dim: Dim, m: &[f64], v: [f64; 3]) -> [f64; 3] {
    match dim {
        Dim::Two => [m[0] * v[0] + m[1] * v[1], m[1] * v[0] + m[2] * v[1], 0.0],
        Dim::Three => [
            m[0] * v[0] + m[1] * v[1] + m[2] * v[2],
            m[1] * v[0] + m[3] * v[1] + m[4] * v[2],
            m[2] * v[0] + m[4] * v[1] + m[5] * v[2],
        ],
    }
}

/// Determinant of the packed metric.
#[inline]
pub fn metric_det(dim: Dim, m: &[f64]) -> f64 {
    match dim {
        Dim::Two => m[0] * m[2] - m[1] * m[1],
        Dim::Three => {
            m[0] * (m[3] * m[5] - m[4] * m[4]) - m[1] * (m[1] * m[5] - m[4] * m[2])
                + m[2] * (m[1] * m[4] - m[3] * m[2])
        }
    }
}

/// Arithmetic mean of packed metrics, written into `out`.
pub fn metric_mean<'a>(dim: Dim, metrics: impl IntoIterator<Item = &'a [f64]>, out: &mut [f64]) {
    let msize = dim.msize();
    out[..msize].fill(0.0);
    let mut count = 0usize;
    for m in metrics {
        for i in 0..msize {
            out[i] += m[i];
        }
        count += 1;
    }
    if count > 0 {
        let inv = 1.0 / count as f64;
        for x in out[..msize].iter_mut() {
            *x *= inv;
        }
    }
}

/// Squared length of `v` under the packed metric `m`.
#[inline]
pub fn metric_length2(dim: Dim, m: &[f64], v: [f64; 3]) -> f64 {
    let mv = metric_apply(dim, m, v);
    v[0] * mv[0] + v[1] * mv[1] + v[2] * mv[2]
}

/// Length of the edge `e` under linear interpolation of the endpoint metrics.
///
/// The exact integral `∫₀¹ √(eᵀ M(t) e) dt` with `M(t)` linear between the
/// endpoints is approximated by the closed form
/// `(2/3)·(a² + ab + b²)/(a + b)` where `a`, `b` are the edge lengths under
/// the two endpoint metrics. The form is exact when `a == b`.
pub fn metric_edge_length(dim: Dim, m0: &[f64], m1: &[f64], e: [f64; 3]) -> f64 {
    let a = metric_length2(dim, m0, e).max(0.0).sqrt();
    let b = metric_length2(dim, m1, e).max(0.0).sqrt();
    let s = a + b;
    if s <= f64::EPSILON {
        return 0.0;
    }
    (2.0 / 3.0) * (a * a + a * b + b * b) / s
}
