//! Element property oracle: signed measures and the Lipnikov quality
//! functional with its analytic gradient.
//!
//! The quality of an element is a shape measure in metric space, 1 for an
//! element that is equilateral under the local metric and approaching 0 as it
//! degenerates. Inverted elements yield non-positive quality. The forms used:
//!
//! - 2D: `q = (12/√3) · A_m / Σ l²` over the three edges,
//! - 3D: `q = (6⁴·√2) · V_m / (Σ l)³` over the six edges,
//!
//! where lengths are measured under the element-averaged metric and `A_m`,
//! `V_m` are the Euclidean measures scaled by `√det(M̄)`.

use super::metric::{metric_apply, metric_det, metric_length2, metric_mean};
use super::{cross, dot, sub, Dim};

const LIPNIKOV_CONST_2D: f64 = 6.92820323027551; // 12/√3
const LIPNIKOV_CONST_3D: f64 = 1832.8207768355312; // 6⁴·√2

/// Edge pairs of the reference triangle and tetrahedron. The first `ndims`
/// entries are the edges incident to vertex 0; the gradient uses that.
const TRI_EDGES: [(usize, usize); 3] = [(0, 1), (0, 2), (1, 2)];
const TET_EDGES: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Dimension-tagged element geometry oracle.
#[derive(Copy, Clone, Debug)]
pub struct ElementProperty {
    dim: Dim,
}

impl ElementProperty {
    pub fn new(dim: Dim) -> Self {
        Self { dim }
    }

    #[inline]
    pub fn dim(&self) -> Dim {
        self.dim
    }

    /// Signed area of the triangle `(x0, x1, x2)` in the xy-plane.
    #[inline]
    pub fn area(&self, x0: [f64; 3], x1: [f64; 3], x2: [f64; 3]) -> f64 {
        let a = sub(x1, x0);
        let b = sub(x2, x0);
        0.5 * (a[0] * b[1] - a[1] * b[0])
    }

    /// Signed volume of the tetrahedron `(x0, x1, x2, x3)`.
    #[inline]
    pub fn volume(&self, x0: [f64; 3], x1: [f64; 3], x2: [f64; 3], x3: [f64; 3]) -> f64 {
        let a = sub(x1, x0);
        let b = sub(x2, x0);
        let c = sub(x3, x0);
        dot(a, cross(b, c)) / 6.0
    }

    /// Signed measure of an element given `nloc` vertex positions.
    #[inline]
    pub fn measure(&self, xs: &[[f64; 3]]) -> f64 {
        match self.dim {
            Dim::Two => self.area(xs[0], xs[1], xs[2]),
            Dim::Three => self.volume(xs[0], xs[1], xs[2], xs[3]),
        }
    }

    /// Lipnikov quality of an element from `nloc` positions and `nloc`
    /// packed vertex metrics.
    pub fn lipnikov(&self, xs: &[[f64; 3]], ms: &[&[f64]]) -> f64 {
        let mut mbar = [0.0f64; 6];
        metric_mean(self.dim, ms.iter().copied(), &mut mbar);
        let mbar = &mbar[..self.dim.msize()];

        match self.dim {
            Dim::Two => {
                let mut l2 = 0.0;
                for &(i, j) in &TRI_EDGES {
                    l2 += metric_length2(self.dim, mbar, sub(xs[j], xs[i]));
                }
                if l2 <= f64::EPSILON {
                    return 0.0;
                }
                let det = metric_det(self.dim, mbar).max(0.0);
                let a_m = self.area(xs[0], xs[1], xs[2]) * det.sqrt();
                LIPNIKOV_CONST_2D * a_m / l2
            }
            Dim::Three => {
                let mut l = 0.0;
                for &(i, j) in &TET_EDGES {
                    l += metric_length2(self.dim, mbar, sub(xs[j], xs[i]))
                        .max(0.0)
                        .sqrt();
                }
                if l <= f64::EPSILON {
                    return 0.0;
                }
                let det = metric_det(self.dim, mbar).max(0.0);
                let v_m = self.volume(xs[0], xs[1], xs[2], xs[3]) * det.sqrt();
                LIPNIKOV_CONST_3D * v_m / (l * l * l)
            }
        }
    }

    /// Analytic gradient of the element quality with respect to the position
    /// of `xs[0]`, with the metric frozen at `m0` (the metric of the moving
    /// vertex). The caller must order `xs` so the moving vertex is first
    /// while preserving positive orientation.
    pub fn lipnikov_grad(&self, xs: &[[f64; 3]], m0: &[f64]) -> [f64; 3] {
        let sqrt_det = metric_det(self.dim, m0).max(0.0).sqrt();

        match self.dim {
            Dim::Two => {
                // q = C·√det·A/S with S = Σ l² under m0.
                let mut s = 0.0;
                for &(i, j) in &TRI_EDGES {
                    s += metric_length2(self.dim, m0, sub(xs[j], xs[i]));
                }
                if s <= f64::EPSILON {
                    return [0.0; 3];
                }
                let a = self.area(xs[0], xs[1], xs[2]);

                // ∇A wrt x0, and ∇S = Σ -2·M·(xi - x0) over edges at x0.
                let grad_a = [0.5 * (xs[1][1] - xs[2][1]), 0.5 * (xs[2][0] - xs[1][0]), 0.0];
                let mut grad_s = [0.0f64; 3];
                for i in 1..3 {
                    let md = metric_apply(self.dim, m0, sub(xs[i], xs[0]));
                    for k in 0..2 {
                        grad_s[k] -= 2.0 * md[k];
                    }
                }

                let c = LIPNIKOV_CONST_2D * sqrt_det;
                let mut g = [0.0f64; 3];
                for k in 0..2 {
                    g[k] = c * (grad_a[k] / s - a * grad_s[k] / (s * s));
                }
                g
            }
            Dim::Three => {
                // q = C·√det·V/L³ with L = Σ l under m0.
                let mut l_sum = 0.0;
                let mut grad_l = [0.0f64; 3];
                for &(i, j) in &TET_EDGES {
                    let d = sub(xs[j], xs[i]);
                    let len = metric_length2(self.dim, m0, d).max(0.0).sqrt();
                    l_sum += len;
                    if i == 0 && len > f64::EPSILON {
                        let md = metric_apply(self.dim, m0, d);
                        for k in 0..3 {
                            grad_l[k] -= md[k] / len;
                        }
                    }
                }
                if l_sum <= f64::EPSILON {
                    return [0.0; 3];
                }
                let v = self.volume(xs[0], xs[1], xs[2], xs[3]);

                // ∇V wrt x0 is -1/6 of the opposite-face normal.
                let n = cross(sub(xs[2], xs[1]), sub(xs[3], xs[1]));
                let grad_v = [-n[0] / 6.0, -n[1] / 6.0, -n[2] / 6.0];

                let c = LIPNIKOV_CONST_3D * sqrt_det;
                let l3 = l_sum * l_sum * l_sum;
                let l4 = l3 * l_sum;
                [
                    c * (grad_v[0] / l3 - 3.0 * v * grad_l[0] / l4),
                    c * (grad_v[1] / l3 - 3.0 * v * grad_l[1] / l4),
                    c * (grad_v[2] / l3 - 3.0 * v * grad_l[2] / l4),
                ]
            }
        }
    }
}
