//! Vertex smoothing in metric space.
//!
//! Relocates interior, owned, non-boundary vertices so the worst incident
//! element quality improves, never inverting an element. Three kernels are
//! selectable: plain metric-space Laplacian, "smart" Laplacian (Laplacian
//! candidate accepted only on quality improvement), and an Linf optimiser
//! that ascends the worst element's quality gradient under a backtracking
//! line search.
//!
//! Scheduling mirrors the coarsener: a distance-2 colouring yields bags of
//! vertices that share no element, processed without mutual synchronisation.
//! Between colour bags the halo coordinates and metrics of shared vertices
//! are exchanged and the quality cache of halo-incident elements refreshed.
//! A vertex is revisited after the first sweep only while it is *active*;
//! accepting a move activates the neighbourhood.

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::algs::colour::colour_distance2;
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::halo::halo_update;
use crate::geometry::{norm, sub, Dim, ElementProperty};
use crate::mesh::Mesh;
use crate::mesh_error::MeshAdaptError;

/// Quality improvement below this is treated as noise by the smart
/// Laplacian acceptance test.
const EPSILON_Q: f64 = 1.0e-6;

/// Backtracking line-search depth of the Linf optimiser.
const MAX_LINE_SEARCH: usize = 10;

/// Selectable smoothing kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SmoothMethod {
    Laplacian,
    SmartLaplacian,
    OptimisationLinf,
}

impl SmoothMethod {
    /// Resolve a user-supplied kernel name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Laplacian" => Some(SmoothMethod::Laplacian),
            "smart Laplacian" => Some(SmoothMethod::SmartLaplacian),
            "optimisation Linf" => Some(SmoothMethod::OptimisationLinf),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SmoothMethod::Laplacian => "Laplacian",
            SmoothMethod::SmartLaplacian => "smart Laplacian",
            SmoothMethod::OptimisationLinf => "optimisation Linf",
        }
    }
}

/// An accepted candidate move: new position and interpolated metric.
#[derive(Copy, Clone, Debug)]
struct Proposal {
    p: [f64; 3],
    metric: [f64; 6],
}

/// Metric-space vertex smoother.
pub struct Smooth<'a, C: Communicator> {
    mesh: &'a mut Mesh,
    comm: &'a C,
    property: ElementProperty,
    quality: Vec<f64>,
    colour_sets: Vec<Vec<usize>>,
    max_colour: i32,
    good_q: f64,
    epsilon_q: f64,
    halo_elements: Vec<usize>,
}

impl<'a, C: Communicator> Smooth<'a, C> {
    pub fn new(mesh: &'a mut Mesh, comm: &'a C) -> Self {
        let property = ElementProperty::new(mesh.dim);
        Self {
            mesh,
            comm,
            property,
            quality: Vec::new(),
            colour_sets: Vec::new(),
            max_colour: -1,
            good_q: 0.0,
            epsilon_q: EPSILON_Q,
            halo_elements: Vec::new(),
        }
    }

    /// Smooth with the named method for up to `max_iterations` sweeps. An
    /// unknown method name falls back to "optimisation Linf" with a
    /// diagnostic. `quality_tol`, when given, overrides the mean-quality
    /// early-out threshold of the optimisation kernel.
    pub fn smooth(
        &mut self,
        method: &str,
        max_iterations: usize,
        quality_tol: Option<f64>,
    ) -> Result<(), MeshAdaptError> {
        let kernel = SmoothMethod::from_name(method).unwrap_or_else(|| {
            warn!(method, "unknown smoothing method, using \"optimisation Linf\"");
            SmoothMethod::OptimisationLinf
        });

        self.init_cache(quality_tol);
        if self.max_colour < 1 {
            return Ok(());
        }

        let coords_tag = CommTag::new(0x0500);
        let metric_tag = CommTag::new(0x0501);
        let nparts = self.comm.size();

        let mut active = vec![false; self.mesh.num_nodes()];

        for iter in 0..max_iterations {
            let gated = iter > 0;
            let mut accepted = 0usize;

            for ic in 0..self.max_colour as usize {
                let bag = if ic < self.colour_sets.len() {
                    std::mem::take(&mut self.colour_sets[ic])
                } else {
                    Vec::new()
                };

                accepted += self.process_colour(&bag, kernel, gated, &mut active);

                if ic < self.colour_sets.len() {
                    self.colour_sets[ic] = bag;
                }

                if nparts > 1 {
                    let ndims = self.mesh.dim.ndims();
                    let msize = self.mesh.dim.msize();
                    halo_update(
                        self.comm,
                        &self.mesh.send,
                        &self.mesh.recv,
                        ndims,
                        &mut self.mesh.coords,
                        coords_tag,
                    )?;
                    halo_update(
                        self.comm,
                        &self.mesh.send,
                        &self.mesh.recv,
                        msize,
                        &mut self.mesh.metric,
                        metric_tag,
                    )?;
                    for i in 0..self.halo_elements.len() {
                        self.update_quality(self.halo_elements[i]);
                    }
                }
            }

            debug!(iter, accepted, "smoothing sweep complete");
        }

        Ok(())
    }

    /// Minimum element quality over the live mesh, from the cache.
    pub fn min_quality(&self) -> f64 {
        (0..self.mesh.num_elements())
            .filter(|&e| self.mesh.element(e).is_some())
            .map(|e| self.quality[e])
            .fold(f64::INFINITY, f64::min)
    }

    /// Colour the mesh, populate the quality cache and choose `good_q`.
    fn init_cache(&mut self, quality_tol: Option<f64>) {
        let nnodes = self.mesh.num_nodes();
        let colour = colour_distance2(&self.mesh.nnlist, &self.mesh.lnn2gnn);
        let boundary = self.mesh.boundary_nodes();

        let mut local_max = -1i32;
        let mut sets: Vec<Vec<usize>> = Vec::new();
        for v in 0..nnodes {
            if colour[v] < 0
                || !self.mesh.is_owned_node(v)
                || self.mesh.nnlist[v].is_empty()
                || boundary.contains(&v)
            {
                continue;
            }
            let c = (colour[v] - 1) as usize;
            if sets.len() <= c {
                sets.resize_with(c + 1, Vec::new);
            }
            sets[c].push(v);
            local_max = local_max.max(colour[v]);
        }
        self.colour_sets = sets;
        self.max_colour = self.comm.allreduce_max_i32(local_max);

        let nelements = self.mesh.num_elements();
        self.quality = vec![1.0; nelements];
        let mut qsum = 0.0;
        let mut live = 0usize;
        for e in 0..nelements {
            if self.mesh.element(e).is_some() {
                self.update_quality(e);
                qsum += self.quality[e];
                live += 1;
            }
        }
        self.good_q = match quality_tol {
            Some(tol) if tol > 0.0 => tol,
            _ if live > 0 => qsum / live as f64,
            _ => 0.0,
        };

        self.halo_elements.clear();
        if self.comm.size() > 1 {
            for e in 0..nelements {
                if let Some(verts) = self.mesh.element(e) {
                    if verts.iter().any(|&v| !self.mesh.is_owned_node(v)) {
                        self.halo_elements.push(e);
                    }
                }
            }
        }
    }

    /// Run one colour bag: propose moves in parallel (the bag shares no
    /// element, so reads never race a commit), then commit serially and
    /// activate the neighbourhood of every accepted vertex.
    fn process_colour(
        &mut self,
        bag: &[usize],
        kernel: SmoothMethod,
        gated: bool,
        active: &mut [bool],
    ) -> usize {
        let candidates: Vec<usize> = bag
            .iter()
            .copied()
            .filter(|&v| !gated || active[v])
            .collect();
        for &v in &candidates {
            active[v] = false;
        }

        let proposals: Vec<(usize, Proposal)>;
        {
            let this = &*self;
            let run = |v: usize| this.propose(v, kernel).map(|p| (v, p));
            #[cfg(feature = "rayon")]
            {
                proposals = candidates.par_iter().copied().filter_map(run).collect();
            }
            #[cfg(not(feature = "rayon"))]
            {
                proposals = candidates.iter().copied().filter_map(run).collect();
            }
        }

        let accepted = proposals.len();
        for (v, proposal) in proposals {
            self.mesh.set_coord(v, proposal.p);
            let msize = self.mesh.dim.msize();
            self.mesh.set_metric(v, &proposal.metric[..msize]);
            let elements: Vec<usize> = self.mesh.nelist[v].iter().copied().collect();
            for e in elements {
                self.update_quality(e);
            }
            for &w in &self.mesh.nnlist[v] {
                active[w] = true;
            }
        }
        accepted
    }

    fn propose(&self, v: usize, kernel: SmoothMethod) -> Option<Proposal> {
        match kernel {
            SmoothMethod::Laplacian => self.laplacian_kernel(v),
            SmoothMethod::SmartLaplacian => self.smart_laplacian_kernel(v),
            SmoothMethod::OptimisationLinf => self.optimisation_linf_kernel(v),
        }
    }

    /// Metric-weighted Laplacian displacement: solve `A b = q` with
    /// `A = Σ M(v)` and `q = Σ M(v)·(x_w − x_v)` over the vertex patch.
    fn laplacian_position(&self, v: usize) -> Option<[f64; 3]> {
        let patch = &self.mesh.nnlist[v];
        if patch.is_empty() {
            return None;
        }
        let x0 = self.mesh.coord(v);
        let m = self.mesh.metric_of(v);
        let nd = self.mesh.dim.ndims();

        let mut a = [[0.0f64; 3]; 3];
        let mut rhs = [0.0f64; 3];
        for &w in patch {
            let d = sub(self.mesh.coord(w), x0);
            let md = crate::geometry::metric_apply(self.mesh.dim, m, d);
            for k in 0..nd {
                rhs[k] += md[k];
            }
            match self.mesh.dim {
                Dim::Two => {
                    a[0][0] += m[0];
                    a[0][1] += m[1];
                    a[1][1] += m[2];
                }
                Dim::Three => {
                    a[0][0] += m[0];
                    a[0][1] += m[1];
                    a[0][2] += m[2];
                    a[1][1] += m[3];
                    a[1][2] += m[4];
                    a[2][2] += m[5];
                }
            }
        }
        a[1][0] = a[0][1];
        a[2][0] = a[0][2];
        a[2][1] = a[1][2];

        let b = solve_spd(self.mesh.dim, &a, &rhs)?;
        Some([x0[0] + b[0], x0[1] + b[1], x0[2] + b[2]])
    }

    fn laplacian_kernel(&self, v: usize) -> Option<Proposal> {
        let p = self.laplacian_position(v)?;
        let metric = self.generate_location(v, p)?;
        Some(Proposal { p, metric })
    }

    fn smart_laplacian_kernel(&self, v: usize) -> Option<Proposal> {
        let p = self.laplacian_position(v)?;
        let metric = self.generate_location(v, p)?;

        let q_old = self.functional_linf(v);
        let q_new = self.functional_linf_candidate(v, p, &metric);
        if q_new - q_old < self.epsilon_q {
            return None;
        }
        Some(Proposal { p, metric })
    }

    /// Ascend the quality gradient of the worst incident element, clipped by
    /// a linear model of where another element becomes equally bad, with a
    /// halving line search that only commits strict worst-case improvement.
    fn optimisation_linf_kernel(&self, v: usize) -> Option<Proposal> {
        let x0 = self.mesh.coord(v);
        let nd = self.mesh.dim.ndims();

        let mut worst = (f64::MAX, usize::MAX);
        for &e in &self.mesh.nelist[v] {
            if self.quality[e] < worst.0 {
                worst = (self.quality[e], e);
            }
        }
        if worst.1 == usize::MAX {
            return None;
        }
        // Already good enough.
        if worst.0 > self.good_q {
            return None;
        }

        let grad_w = self.element_grad(worst.1, v)?;
        let mag = norm(grad_w);
        if !mag.is_normal() || mag <= 0.0 {
            warn!(
                vertex = v,
                mag, "non-normal quality gradient; metric field is rubbish"
            );
            return None;
        }
        let search = [grad_w[0] / mag, grad_w[1] / mag, grad_w[2] / mag];

        // Initial step from the neighbourhood bounding box.
        let mut lo = [f64::MAX; 3];
        let mut hi = [f64::MIN; 3];
        for &w in &self.mesh.nnlist[v] {
            let x = self.mesh.coord(w);
            for k in 0..nd {
                lo[k] = lo[k].min(x[k]);
                hi[k] = hi[k].max(x[k]);
            }
        }
        let mut alpha: f64 = (0..nd).map(|k| hi[k] - lo[k]).sum::<f64>() / (2.0 * nd as f64);

        // Clip by the linear prediction of where another incident element
        // becomes the worst.
        let s_dot_w = dot3(search, grad_w);
        for &e in &self.mesh.nelist[v] {
            if e == worst.1 {
                continue;
            }
            let grad_e = match self.element_grad(e, v) {
                Some(g) => g,
                None => continue,
            };
            let denom = s_dot_w - dot3(search, grad_e);
            let alpha_e = (self.quality[e] - worst.0) / denom;
            if alpha_e.is_finite() && alpha_e > 0.0 {
                alpha = alpha.min(alpha_e);
            }
        }

        // Backtracking line search; each probe must strictly beat the old
        // worst on every incident element.
        for _ in 0..MAX_LINE_SEARCH {
            alpha *= 0.5;
            let p = [
                x0[0] + alpha * search[0],
                x0[1] + alpha * search[1],
                x0[2] + alpha * search[2],
            ];
            let metric = match self.generate_location(v, p) {
                Some(m) => m,
                None => continue,
            };

            let mut improved = true;
            for &e in &self.mesh.nelist[v] {
                let q = self.quality_with_candidate(e, v, p, &metric);
                if q <= worst.0 {
                    improved = false;
                    break;
                }
            }
            if improved {
                return Some(Proposal { p, metric });
            }
        }
        None
    }

    /// Worst cached quality over the elements incident to `v`.
    fn functional_linf(&self, v: usize) -> f64 {
        self.mesh.nelist[v]
            .iter()
            .map(|&e| self.quality[e])
            .fold(f64::MAX, f64::min)
    }

    /// Worst quality over the incident elements with the candidate position
    /// and metric substituted for `v`.
    fn functional_linf_candidate(&self, v: usize, p: [f64; 3], mp: &[f64; 6]) -> f64 {
        self.mesh.nelist[v]
            .iter()
            .map(|&e| self.quality_with_candidate(e, v, p, mp))
            .fold(f64::MAX, f64::min)
    }

    fn quality_with_candidate(&self, e: usize, v: usize, p: [f64; 3], mp: &[f64; 6]) -> f64 {
        let verts = match self.mesh.element(e) {
            Some(n) => n,
            None => return f64::MAX,
        };
        let msize = self.mesh.dim.msize();
        let mut xs: Vec<[f64; 3]> = Vec::with_capacity(verts.len());
        let mut ms: Vec<&[f64]> = Vec::with_capacity(verts.len());
        for &u in verts {
            if u == v {
                xs.push(p);
                ms.push(&mp[..msize]);
            } else {
                xs.push(self.mesh.coord(u));
                ms.push(self.mesh.metric_of(u));
            }
        }
        self.property.lipnikov(&xs, &ms)
    }

    /// Gradient of element `e`'s quality with respect to the position of its
    /// vertex `v`, metric frozen at `v`. The element vertex order is rotated
    /// (orientation preserved) so the moving vertex leads.
    fn element_grad(&self, e: usize, v: usize) -> Option<[f64; 3]> {
        let verts = self.mesh.element(e)?;
        let loc = verts.iter().position(|&u| u == v)?;
        let order: &[usize] = match self.mesh.dim {
            Dim::Two => match loc {
                0 => &[0, 1, 2],
                1 => &[1, 2, 0],
                _ => &[2, 0, 1],
            },
            Dim::Three => match loc {
                0 => &[0, 1, 2, 3],
                1 => &[1, 2, 0, 3],
                2 => &[2, 0, 1, 3],
                _ => &[3, 0, 2, 1],
            },
        };
        let xs: Vec<[f64; 3]> = order.iter().map(|&i| self.mesh.coord(verts[i])).collect();
        Some(self.property.lipnikov_grad(&xs, self.mesh.metric_of(v)))
    }

    /// Interpolate the metric at candidate position `p` for vertex `v`: pick
    /// the incident element whose barycentric coordinates of `p` have the
    /// greatest minimum component, require it not to invert, and blend its
    /// vertex metrics barycentrically.
    fn generate_location(&self, v: usize, p: [f64; 3]) -> Option<[f64; 6]> {
        let msize = self.mesh.dim.msize();
        let nloc = self.mesh.dim.nloc();

        let mut best_min = f64::MIN;
        let mut best: Option<(usize, [f64; 4], f64)> = None;

        for &e in &self.mesh.nelist[v] {
            let verts = self.mesh.element(e)?;
            let xs: Vec<[f64; 3]> = verts.iter().map(|&u| self.mesh.coord(u)).collect();
            let full = self.property.measure(&xs);
            if full.abs() <= f64::EPSILON {
                return None;
            }

            // Substituting p for v must not invert this element.
            let loc = verts.iter().position(|&u| u == v)?;
            let mut sub_xs = xs.clone();
            sub_xs[loc] = p;
            let vol_sub = self.property.measure(&sub_xs);
            if vol_sub < 0.0 {
                return None;
            }

            let mut bary = [0.0f64; 4];
            let mut min_l = f64::MAX;
            for i in 0..nloc {
                let mut probe = xs.clone();
                probe[i] = p;
                bary[i] = self.property.measure(&probe) / full;
                min_l = min_l.min(bary[i]);
            }
            if best.is_none() || min_l > best_min {
                best_min = min_l;
                best = Some((e, bary, vol_sub));
            }
        }

        let (e, bary, vol_sub) = best?;
        if vol_sub <= 0.0 {
            return None;
        }

        let verts = self.mesh.element(e)?;
        let mut mp = [0.0f64; 6];
        for (i, &u) in verts.iter().enumerate() {
            let m = self.mesh.metric_of(u);
            for k in 0..msize {
                mp[k] += bary[i] * m[k];
            }
        }
        Some(mp)
    }

    fn update_quality(&mut self, e: usize) {
        let verts = match self.mesh.element(e) {
            Some(n) => n,
            None => {
                self.quality[e] = 1.0;
                return;
            }
        };
        let xs: Vec<[f64; 3]> = verts.iter().map(|&u| self.mesh.coord(u)).collect();
        let ms: Vec<&[f64]> = verts.iter().map(|&u| self.mesh.metric_of(u)).collect();
        self.quality[e] = self.property.lipnikov(&xs, &ms);
    }
}

#[inline]
fn dot3(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Direct solve of the small SPD system `A x = b` (2x2 or 3x3).
fn solve_spd(dim: Dim, a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    match dim {
        Dim::Two => {
            let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
            if !det.is_normal() {
                return None;
            }
            Some([
                (b[0] * a[1][1] - b[1] * a[0][1]) / det,
                (a[0][0] * b[1] - a[1][0] * b[0]) / det,
                0.0,
            ])
        }
        Dim::Three => {
            let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
                - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
                + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);
            if !det.is_normal() {
                return None;
            }
            let inv = 1.0 / det;
            let x = [
                (a[1][1] * a[2][2] - a[1][2] * a[2][1]) * b[0]
                    + (a[0][2] * a[2][1] - a[0][1] * a[2][2]) * b[1]
                    + (a[0][1] * a[1][2] - a[0][2] * a[1][1]) * b[2],
                (a[1][2] * a[2][0] - a[1][0] * a[2][2]) * b[0]
                    + (a[0][0] * a[2][2] - a[0][2] * a[2][0]) * b[1]
                    + (a[0][2] * a[1][0] - a[0][0] * a[1][2]) * b[2],
                (a[1][0] * a[2][1] - a[1][1] * a[2][0]) * b[0]
                    + (a[0][1] * a[2][0] - a[0][0] * a[2][1]) * b[1]
                    + (a[0][0] * a[1][1] - a[0][1] * a[1][0]) * b[2],
            ];
            Some([x[0] * inv, x[1] * inv, x[2] * inv])
        }
    }
}
