//! Surface classification for the volumetric mesh.
//!
//! Identifies the boundary facets of the domain, orients them outward,
//! groups them into coplanar patches, and exposes the predicates the
//! coarsener needs before it may alter surface topology: corner detection
//! and per-collapse admissibility. Patches pin geometric features — a vertex
//! may only slide within the patches it already lies on.
//!
//! The classifier is rebuilt from scratch after topology changes via
//! [`Surface::find_surface`]; in between, [`Surface::collapse`] keeps the
//! facet tables consistent incrementally. Deleted facets keep their slot
//! with sentinel vertices and are skipped by all queries; re-running
//! `find_surface` implicitly compacts.

use hashbrown::{HashMap, HashSet};
use tracing::warn;

use crate::geometry::{cross, norm, sub, Dim};
use crate::mesh::{Mesh, INVALID};

/// Default dot-product tolerance for two facets to count as coplanar.
pub const COPLANAR_TOLERANCE: f64 = 0.9999999;

/// Boundary classification of a simplicial mesh.
#[derive(Clone, Debug)]
pub struct Surface {
    dim: Dim,
    /// Facet-node list, stride `snloc`; `INVALID` marks a deleted slot.
    senlist: Vec<usize>,
    /// Patch id per facet slot, contiguous positive integers.
    coplanar_ids: Vec<i32>,
    /// Outward unit normal per facet slot, stride `ndims`.
    normals: Vec<f64>,
    /// SNEList: facets incident to each surface vertex.
    snelist: HashMap<usize, HashSet<usize>>,
    surface_nodes: HashSet<usize>,
    coplanar_tol: f64,
}

impl Surface {
    /// Classify the boundary of `mesh` with the default coplanar tolerance.
    pub fn new(mesh: &Mesh) -> Self {
        Self::with_tolerance(mesh, COPLANAR_TOLERANCE)
    }

    /// Classify with an explicit coplanar tolerance.
    pub fn with_tolerance(mesh: &Mesh, tol: f64) -> Self {
        let mut surface = Self {
            dim: mesh.dim,
            senlist: Vec::new(),
            coplanar_ids: Vec::new(),
            normals: Vec::new(),
            snelist: HashMap::new(),
            surface_nodes: HashSet::new(),
            coplanar_tol: tol,
        };
        surface.find_surface(mesh);
        surface
    }

    /// Set the dot-product tolerance used to decide facet coplanarity.
    pub fn set_coplanar_tolerance(&mut self, tol: f64) {
        self.coplanar_tol = tol;
    }

    /// Rebuild the classification from the live elements of `mesh`.
    pub fn find_surface(&mut self, mesh: &Mesh) {
        let nloc = self.dim.nloc();
        let snloc = self.dim.snloc();

        self.senlist.clear();
        self.coplanar_ids.clear();
        self.normals.clear();
        self.snelist.clear();
        self.surface_nodes.clear();

        // A face is a boundary facet iff it belongs to exactly one element.
        let mut face_count: HashMap<Vec<usize>, u32> = HashMap::new();
        for e in 0..mesh.num_elements() {
            let verts = match mesh.element(e) {
                Some(n) => n,
                None => continue,
            };
            for j in 0..nloc {
                let mut key: Vec<usize> = (1..nloc).map(|k| verts[(j + k) % nloc]).collect();
                key.sort_unstable();
                *face_count.entry(key).or_insert(0) += 1;
            }
        }

        for e in 0..mesh.num_elements() {
            let verts: Vec<usize> = match mesh.element(e) {
                Some(n) => n.to_vec(),
                None => continue,
            };
            for j in 0..nloc {
                let mut key: Vec<usize> = (1..nloc).map(|k| verts[(j + k) % nloc]).collect();
                key.sort_unstable();
                match face_count.get(&key).copied().unwrap_or(0) {
                    1 => {
                        let mut facet: Vec<usize> =
                            (1..nloc).map(|k| verts[(j + k) % nloc]).collect();
                        let normal = self.outward_normal(mesh, &mut facet, verts[j]);
                        self.push_facet(&facet, 0, normal);
                    }
                    0 | 2 => {}
                    c => {
                        warn!(count = c, "face shared by more than two elements; skipping dangling facet");
                        // Remove so the remaining encounters are skipped too.
                        face_count.remove(&key);
                    }
                }
            }
        }

        self.calculate_coplanar_ids();
    }

    /// Unit normal of `facet`, oriented away from the interior vertex
    /// `opposite`. The facet vertex order is flipped in place when needed so
    /// stored orientation and normal stay consistent.
    fn outward_normal(&self, mesh: &Mesh, facet: &mut [usize], opposite: usize) -> Vec<f64> {
        let x0 = mesh.coord(facet[0]);
        let mut n = match self.dim {
            Dim::Two => {
                let d = sub(mesh.coord(facet[1]), x0);
                [d[1], -d[0], 0.0]
            }
            Dim::Three => cross(
                sub(mesh.coord(facet[1]), x0),
                sub(mesh.coord(facet[2]), x0),
            ),
        };
        let mag = norm(n);
        if mag <= f64::EPSILON {
            warn!("degenerate boundary facet with zero-length normal");
            return vec![0.0; self.dim.ndims()];
        }
        for c in n.iter_mut() {
            *c /= mag;
        }

        let mut centroid = [0.0f64; 3];
        for &v in facet.iter() {
            let x = mesh.coord(v);
            for k in 0..3 {
                centroid[k] += x[k] / facet.len() as f64;
            }
        }
        let toward = sub(centroid, mesh.coord(opposite));
        if n[0] * toward[0] + n[1] * toward[1] + n[2] * toward[2] < 0.0 {
            for c in n.iter_mut() {
                *c = -*c;
            }
            facet.swap(self.dim.snloc() - 2, self.dim.snloc() - 1);
        }
        n[..self.dim.ndims()].to_vec()
    }

    fn push_facet(&mut self, facet: &[usize], coplanar_id: i32, normal: Vec<f64>) -> usize {
        let i = self.num_facets();
        self.senlist.extend_from_slice(facet);
        self.coplanar_ids.push(coplanar_id);
        self.normals.extend_from_slice(&normal);
        for &v in facet {
            self.snelist.entry(v).or_default().insert(i);
            self.surface_nodes.insert(v);
        }
        i
    }

    /// Assign contiguous patch ids by breadth-first traversal over shared
    /// sub-facets, comparing every candidate against the patch's *seed*
    /// normal so curvature cannot drift a patch around a corner.
    fn calculate_coplanar_ids(&mut self) {
        let snloc = self.dim.snloc();
        let nfacets = self.num_facets();

        // Facet-facet adjacency across each of the snloc sub-facets.
        let mut eelist: Vec<Option<usize>> = vec![None; nfacets * snloc];
        for i in 0..nfacets {
            let facet = match self.facet(i) {
                Some(f) => f,
                None => continue,
            };
            for j in 0..snloc {
                let neighbour = match self.dim {
                    Dim::Two => {
                        let v = facet[j];
                        self.snelist[&v].iter().copied().find(|&f| f != i)
                    }
                    Dim::Three => {
                        let n1 = facet[(j + 1) % 3];
                        let n2 = facet[(j + 2) % 3];
                        self.snelist[&n1]
                            .iter()
                            .copied()
                            .find(|&f| f != i && self.snelist[&n2].contains(&f))
                    }
                };
                if neighbour.is_none() {
                    warn!(facet = i, subfacet = j, "boundary facet has no neighbour across sub-facet");
                }
                eelist[i * snloc + j] = neighbour;
            }
        }

        for id in self.coplanar_ids.iter_mut() {
            *id = 0;
        }

        let ndims = self.dim.ndims();
        let mut current_id = 1;
        for seed in 0..nfacets {
            if self.coplanar_ids[seed] != 0 || self.facet(seed).is_none() {
                continue;
            }
            self.coplanar_ids[seed] = current_id;
            let seed_normal: Vec<f64> =
                self.normals[seed * ndims..(seed + 1) * ndims].to_vec();

            let mut front = std::collections::VecDeque::new();
            front.push_back(seed);
            while let Some(f) = front.pop_front() {
                for j in 0..snloc {
                    let nb = match eelist[f * snloc + j] {
                        Some(nb) => nb,
                        None => continue,
                    };
                    if self.coplanar_ids[nb] != 0 {
                        continue;
                    }
                    let coplanar: f64 = (0..ndims)
                        .map(|d| seed_normal[d] * self.normals[nb * ndims + d])
                        .sum();
                    if coplanar >= self.coplanar_tol {
                        self.coplanar_ids[nb] = current_id;
                        front.push_back(nb);
                    }
                }
            }
            current_id += 1;
        }
    }

    /// Number of facet slots, live and deleted.
    #[inline]
    pub fn num_facets(&self) -> usize {
        self.senlist.len() / self.dim.snloc()
    }

    /// Vertex tuple of a live facet, `None` for a deleted slot.
    #[inline]
    pub fn facet(&self, i: usize) -> Option<&[usize]> {
        let snloc = self.dim.snloc();
        let f = &self.senlist[i * snloc..(i + 1) * snloc];
        if f[0] == INVALID {
            None
        } else {
            Some(f)
        }
    }

    #[inline]
    pub fn coplanar_id(&self, i: usize) -> i32 {
        self.coplanar_ids[i]
    }

    /// Outward unit normal of facet `i`.
    #[inline]
    pub fn normal(&self, i: usize) -> &[f64] {
        let nd = self.dim.ndims();
        &self.normals[i * nd..(i + 1) * nd]
    }

    /// Facets incident to a surface vertex.
    pub fn vertex_facets(&self, v: usize) -> Option<&HashSet<usize>> {
        self.snelist.get(&v)
    }

    /// True if the surface contains vertex `v`.
    #[inline]
    pub fn contains_node(&self, v: usize) -> bool {
        self.surface_nodes.contains(&v)
    }

    /// Distinct patch ids incident to `v`.
    fn incident_patches(&self, v: usize) -> HashSet<i32> {
        match self.snelist.get(&v) {
            Some(facets) => facets.iter().map(|&f| self.coplanar_ids[f]).collect(),
            None => HashSet::new(),
        }
    }

    /// A corner vertex is pinned: it touches at least D distinct patches.
    pub fn is_corner_vertex(&self, v: usize) -> bool {
        self.incident_patches(v).len() >= self.dim.ndims()
    }

    /// May `rm` be collapsed onto `target` without moving a geometric
    /// feature? Interior vertices are unconstrained; corners never move; a
    /// vertex on a geometric edge (two patches, 3D) needs both patches at
    /// the target; a vertex on one patch needs that patch at the target.
    pub fn is_collapsible(&self, rm: usize, target: usize) -> bool {
        if !self.surface_nodes.contains(&rm) {
            return true;
        }

        let patches_rm = self.incident_patches(rm);
        if patches_rm.len() >= self.dim.ndims() {
            return false;
        }

        let patches_target = self.incident_patches(target);
        patches_rm.iter().all(|p| patches_target.contains(p))
    }

    /// Apply a certified surface collapse `rm -> target`: facets incident to
    /// both endpoints are deleted, remaining facets of `rm` are relabelled
    /// to `target`, and SNEList is kept exact on every touched vertex.
    pub fn collapse(&mut self, rm: usize, target: usize) {
        debug_assert!(self.is_collapsible(rm, target));
        let snloc = self.dim.snloc();

        self.surface_nodes.remove(&rm);
        let rm_facets = match self.snelist.remove(&rm) {
            Some(f) => f,
            None => return,
        };
        let target_facets = self.snelist.get(&target).cloned().unwrap_or_default();

        for f in rm_facets {
            if target_facets.contains(&f) {
                // Deleted facet: unlink from every incident vertex, then
                // sentinel the slot.
                let verts: Vec<usize> = self.senlist[f * snloc..(f + 1) * snloc].to_vec();
                for v in verts {
                    if v != rm {
                        if let Some(set) = self.snelist.get_mut(&v) {
                            set.remove(&f);
                        }
                    }
                }
                for slot in self.senlist[f * snloc..(f + 1) * snloc].iter_mut() {
                    *slot = INVALID;
                }
            } else {
                for slot in self.senlist[f * snloc..(f + 1) * snloc].iter_mut() {
                    if *slot == rm {
                        *slot = target;
                    }
                }
                self.snelist.entry(target).or_default().insert(f);
            }
        }
    }

    /// Facets all of whose vertices belong to the given element. Used when
    /// packing elements for halo transfer.
    pub fn find_facets(&self, element_verts: &[usize]) -> Vec<usize> {
        let mut out = Vec::new();
        for &v in element_verts {
            if let Some(facets) = self.snelist.get(&v) {
                for &f in facets {
                    if out.contains(&f) {
                        continue;
                    }
                    if let Some(fv) = self.facet(f) {
                        if fv.iter().all(|x| element_verts.contains(x)) {
                            out.push(f);
                        }
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Register a facet received through halo exchange, with the coplanar id
    /// assigned by the sending rank. Duplicates of live facets are ignored.
    /// The sender's vertex order already encodes outward orientation.
    pub fn append_facet(&mut self, facet: &[usize], coplanar_id: i32, mesh: &Mesh) {
        let key: HashSet<usize> = facet.iter().copied().collect();
        if let Some(existing) = self.snelist.get(&facet[0]) {
            for &f in existing {
                if let Some(fv) = self.facet(f) {
                    if fv.len() == key.len() && fv.iter().all(|v| key.contains(v)) {
                        return;
                    }
                }
            }
        }

        let x0 = mesh.coord(facet[0]);
        let mut n = match self.dim {
            Dim::Two => {
                let d = sub(mesh.coord(facet[1]), x0);
                [d[1], -d[0], 0.0]
            }
            Dim::Three => cross(
                sub(mesh.coord(facet[1]), x0),
                sub(mesh.coord(facet[2]), x0),
            ),
        };
        let mag = norm(n);
        if mag > f64::EPSILON {
            for c in n.iter_mut() {
                *c /= mag;
            }
        }
        self.push_facet(facet, coplanar_id, n[..self.dim.ndims()].to_vec());
    }

    /// Count of live facets.
    pub fn live_facets(&self) -> usize {
        (0..self.num_facets()).filter(|&i| self.facet(i).is_some()).count()
    }

    /// Number of distinct patch ids over live facets.
    pub fn num_patches(&self) -> usize {
        let ids: HashSet<i32> = (0..self.num_facets())
            .filter(|&i| self.facet(i).is_some())
            .map(|i| self.coplanar_ids[i])
            .collect();
        ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_four() -> Mesh {
        let coords = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.5];
        let tris = [0, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4];
        Mesh::new_2d(&coords, &tris)
    }

    #[test]
    fn square_boundary_classifies_into_four_patches() {
        let mesh = square_four();
        let surface = Surface::new(&mesh);

        assert_eq!(surface.live_facets(), 4);
        assert_eq!(surface.num_patches(), 4);
        assert!(!surface.contains_node(4));
        for v in 0..4 {
            assert!(surface.contains_node(v));
            assert!(surface.is_corner_vertex(v), "vertex {v} should be a corner");
        }
    }

    #[test]
    fn square_normals_point_outward() {
        let mesh = square_four();
        let surface = Surface::new(&mesh);

        for i in 0..surface.num_facets() {
            let facet = surface.facet(i).unwrap();
            let n = surface.normal(i);
            // Facet midpoint pushed along the normal must leave the unit square.
            let a = mesh.coord(facet[0]);
            let b = mesh.coord(facet[1]);
            let mid = [(a[0] + b[0]) / 2.0, (a[1] + b[1]) / 2.0];
            let out = [mid[0] + 0.1 * n[0], mid[1] + 0.1 * n[1]];
            assert!(
                out[0] < 0.0 || out[0] > 1.0 || out[1] < 0.0 || out[1] > 1.0,
                "normal {n:?} of facet {facet:?} is not outward"
            );
            assert_relative_eq!(n[0].hypot(n[1]), 1.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn classification_is_idempotent() {
        let mesh = square_four();
        let mut surface = Surface::new(&mesh);
        let facets: Vec<Option<Vec<usize>>> = (0..surface.num_facets())
            .map(|i| surface.facet(i).map(|f| f.to_vec()))
            .collect();
        let ids = surface.coplanar_ids.clone();
        let normals = surface.normals.clone();

        surface.find_surface(&mesh);
        let facets2: Vec<Option<Vec<usize>>> = (0..surface.num_facets())
            .map(|i| surface.facet(i).map(|f| f.to_vec()))
            .collect();
        assert_eq!(facets, facets2);
        assert_eq!(ids, surface.coplanar_ids);
        for (a, b) in normals.iter().zip(surface.normals.iter()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-14);
        }
    }

    #[test]
    fn interior_vertex_is_always_collapsible() {
        let mesh = square_four();
        let surface = Surface::new(&mesh);
        for target in 0..4 {
            assert!(surface.is_collapsible(4, target));
        }
    }

    #[test]
    fn boundary_corner_is_never_collapsible() {
        let mesh = square_four();
        let surface = Surface::new(&mesh);
        assert!(!surface.is_collapsible(0, 1));
        assert!(!surface.is_collapsible(1, 4));
    }

    #[test]
    fn edge_midpoint_collapses_only_along_its_patch() {
        // Bottom edge split at (0.5, 0): vertex 5 lies on one patch.
        let coords = [
            0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.5, 0.5, 0.0,
        ];
        let tris = [0, 5, 4, 5, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4];
        let mesh = Mesh::new_2d(&coords, &tris);
        let surface = Surface::new(&mesh);

        assert!(!surface.is_corner_vertex(5));
        assert!(surface.is_collapsible(5, 0));
        assert!(surface.is_collapsible(5, 1));
        // Collapsing onto the interior or a vertex off the bottom patch
        // would move the geometric boundary.
        assert!(!surface.is_collapsible(5, 3));
    }

    #[test]
    fn collapse_removes_shared_facets_and_relabels() {
        let coords = [
            0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.5, 0.5, 0.0,
        ];
        let tris = [0, 5, 4, 5, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4];
        let mesh = Mesh::new_2d(&coords, &tris);
        let mut surface = Surface::new(&mesh);

        let before = surface.live_facets();
        surface.collapse(5, 0);
        assert_eq!(surface.live_facets(), before - 1);
        assert!(!surface.contains_node(5));
        // The surviving bottom facet now runs 0 -> 1.
        let bottom: Vec<usize> = (0..surface.num_facets())
            .filter_map(|i| surface.facet(i))
            .filter(|f| f.contains(&0) && f.contains(&1))
            .flat_map(|f| f.iter().copied())
            .collect();
        assert_eq!(bottom.len(), 2);
    }

    #[test]
    fn single_tetrahedron_is_all_corners() {
        let coords = [
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0,
        ];
        let tets = [0, 1, 2, 3];
        let mesh = Mesh::new_3d(&coords, &tets);
        let surface = Surface::new(&mesh);

        assert_eq!(surface.live_facets(), 4);
        assert_eq!(surface.num_patches(), 4);
        for v in 0..4 {
            assert!(surface.is_corner_vertex(v));
            assert!(!surface.is_collapsible(v, (v + 1) % 4));
        }
    }

    #[test]
    fn tet_normals_point_outward() {
        let coords = [
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0,
        ];
        let tets = [0, 1, 2, 3];
        let mesh = Mesh::new_3d(&coords, &tets);
        let surface = Surface::new(&mesh);

        let centroid = [0.25, 0.25, 0.25];
        for i in 0..surface.num_facets() {
            let facet = surface.facet(i).unwrap();
            let n = surface.normal(i);
            let mut mid = [0.0f64; 3];
            for &v in facet {
                let x = mesh.coord(v);
                for k in 0..3 {
                    mid[k] += x[k] / 3.0;
                }
            }
            let dot: f64 = (0..3).map(|k| n[k] * (mid[k] - centroid[k])).sum();
            assert!(dot > 0.0, "facet {facet:?} normal {n:?} not outward");
        }
    }

    #[test]
    fn find_facets_returns_facets_on_element() {
        let mesh = square_four();
        let surface = Surface::new(&mesh);
        // Element 0 is (0, 1, 4): only the bottom facet lies on it.
        let facets = surface.find_facets(&[0, 1, 4]);
        assert_eq!(facets.len(), 1);
        let f = surface.facet(facets[0]).unwrap();
        assert!(f.contains(&0) && f.contains(&1));
    }
}
