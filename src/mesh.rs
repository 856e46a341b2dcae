//! Unstructured simplicial mesh container.
//!
//! Storage is arena-style: flat coordinate/metric/element arrays indexed by
//! contiguous local ids, with adjacency held as index tables (never owning
//! references). Deleted elements keep their slot with [`INVALID`] in the
//! first vertex position; deleted vertices keep their slot with cleared
//! adjacency. Cyclic relationships (NNList ↔ edges ↔ NEList ↔ elements) are
//! therefore plain index lookups.
//!
//! In distributed use each vertex has an owner rank and a global number;
//! per-peer `send`/`recv` lists describe the halo. Local indices grow when
//! halo exchange appends non-owned vertices.

use hashbrown::{HashMap, HashSet};

use crate::geometry::metric::metric_edge_length;
use crate::geometry::{Dim, ElementProperty};
use crate::mesh_error::MeshAdaptError;

/// Sentinel local index marking a deleted element slot.
pub const INVALID: usize = usize::MAX;

/// Canonical (min, max) key for an undirected edge.
#[inline]
pub fn edge_key(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Per-edge cache: metric length and the set of incident elements.
#[derive(Clone, Debug, Default)]
pub struct Edge {
    pub length: f64,
    pub elements: HashSet<usize>,
}

/// Simplicial mesh with explicit adjacency and halo bookkeeping.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub dim: Dim,
    /// Vertex coordinates, stride `ndims`.
    pub coords: Vec<f64>,
    /// Packed vertex metrics, stride `msize`.
    pub metric: Vec<f64>,
    /// Element-node list, stride `nloc`; `INVALID` in slot 0 marks deletion.
    pub enlist: Vec<usize>,
    /// NNList: neighbour vertices of each vertex, symmetric, duplicate-free.
    pub nnlist: Vec<Vec<usize>>,
    /// NEList: elements incident to each vertex.
    pub nelist: Vec<HashSet<usize>>,
    /// Live edges keyed by canonical vertex pair.
    pub edges: HashMap<(usize, usize), Edge>,
    /// Owner rank of each vertex.
    pub node_owner: Vec<usize>,
    /// Local-to-global vertex numbering, injective across ranks.
    pub lnn2gnn: Vec<usize>,
    /// Per-peer lists of owned vertices mirrored on that peer.
    pub send: Vec<Vec<usize>>,
    /// Per-peer lists of non-owned vertices mirrored from that peer.
    pub recv: Vec<Vec<usize>>,
    pub send_halo: HashSet<usize>,
    pub recv_halo: HashSet<usize>,
    pub rank: usize,
    pub nparts: usize,
}

impl Mesh {
    /// Serial 2D mesh from flat coordinates (stride 2) and triangle list
    /// (stride 3). The metric is initialised to the identity.
    pub fn new_2d(coords: &[f64], enlist: &[usize]) -> Self {
        Self::new_serial(Dim::Two, coords, enlist)
    }

    /// Serial 3D mesh from flat coordinates (stride 3) and tetrahedron list
    /// (stride 4). The metric is initialised to the identity.
    pub fn new_3d(coords: &[f64], enlist: &[usize]) -> Self {
        Self::new_serial(Dim::Three, coords, enlist)
    }

    fn new_serial(dim: Dim, coords: &[f64], enlist: &[usize]) -> Self {
        let nnodes = coords.len() / dim.ndims();
        let owner = vec![0; nnodes];
        let gnn = (0..nnodes).collect();
        Self::with_partition(dim, coords, enlist, owner, gnn, 0, 1)
    }

    /// Mesh over an explicit partition. `send`/`recv` halo lists start empty;
    /// distributed drivers fill them from the overlap before adapting.
    pub fn with_partition(
        dim: Dim,
        coords: &[f64],
        enlist: &[usize],
        node_owner: Vec<usize>,
        lnn2gnn: Vec<usize>,
        rank: usize,
        nparts: usize,
    ) -> Self {
        let nnodes = coords.len() / dim.ndims();
        debug_assert_eq!(node_owner.len(), nnodes);
        debug_assert_eq!(lnn2gnn.len(), nnodes);

        let msize = dim.msize();
        let mut metric = vec![0.0; nnodes * msize];
        let identity: &[f64] = match dim {
            Dim::Two => &[1.0, 0.0, 1.0],
            Dim::Three => &[1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
        };
        for v in 0..nnodes {
            metric[v * msize..(v + 1) * msize].copy_from_slice(identity);
        }

        let mut mesh = Self {
            dim,
            coords: coords.to_vec(),
            metric,
            enlist: enlist.to_vec(),
            nnlist: vec![Vec::new(); nnodes],
            nelist: vec![HashSet::new(); nnodes],
            edges: HashMap::new(),
            node_owner,
            lnn2gnn,
            send: vec![Vec::new(); nparts],
            recv: vec![Vec::new(); nparts],
            send_halo: HashSet::new(),
            recv_halo: HashSet::new(),
            rank,
            nparts,
        };
        mesh.build_adjacency();
        mesh
    }

    /// Rebuild NNList, NEList and the edge table from the element list.
    pub fn build_adjacency(&mut self) {
        for l in self.nnlist.iter_mut() {
            l.clear();
        }
        for s in self.nelist.iter_mut() {
            s.clear();
        }
        self.edges.clear();

        let nloc = self.dim.nloc();
        for e in 0..self.num_elements() {
            let verts: Vec<usize> = match self.element(e) {
                Some(n) => n.to_vec(),
                None => continue,
            };
            for i in 0..nloc {
                self.nelist[verts[i]].insert(e);
                for j in (i + 1)..nloc {
                    let (a, b) = (verts[i], verts[j]);
                    if !self.nnlist[a].contains(&b) {
                        self.nnlist[a].push(b);
                        self.nnlist[b].push(a);
                    }
                    let entry = self
                        .edges
                        .entry(edge_key(a, b))
                        .or_insert_with(Edge::default);
                    entry.elements.insert(e);
                }
            }
        }

        let keys: Vec<(usize, usize)> = self.edges.keys().copied().collect();
        for (a, b) in keys {
            let length = self.edge_length(a, b);
            self.edges.get_mut(&(a, b)).unwrap().length = length;
        }
    }

    /// Number of vertex slots, live and dead, on this rank.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.node_owner.len()
    }

    /// Number of element slots, live and dead.
    #[inline]
    pub fn num_elements(&self) -> usize {
        self.enlist.len() / self.dim.nloc()
    }

    /// Vertex tuple of a live element, `None` for a deleted slot.
    #[inline]
    pub fn element(&self, e: usize) -> Option<&[usize]> {
        let nloc = self.dim.nloc();
        let n = &self.enlist[e * nloc..(e + 1) * nloc];
        if n[0] == INVALID {
            None
        } else {
            Some(n)
        }
    }

    /// Coordinates of a vertex, zero-padded to three components.
    #[inline]
    pub fn coord(&self, v: usize) -> [f64; 3] {
        let nd = self.dim.ndims();
        let s = &self.coords[v * nd..v * nd + nd];
        match self.dim {
            Dim::Two => [s[0], s[1], 0.0],
            Dim::Three => [s[0], s[1], s[2]],
        }
    }

    #[inline]
    pub fn set_coord(&mut self, v: usize, p: [f64; 3]) {
        let nd = self.dim.ndims();
        self.coords[v * nd..v * nd + nd].copy_from_slice(&p[..nd]);
    }

    /// Packed metric of a vertex.
    #[inline]
    pub fn metric_of(&self, v: usize) -> &[f64] {
        let ms = self.dim.msize();
        &self.metric[v * ms..(v + 1) * ms]
    }

    #[inline]
    pub fn set_metric(&mut self, v: usize, m: &[f64]) {
        let ms = self.dim.msize();
        self.metric[v * ms..(v + 1) * ms].copy_from_slice(&m[..ms]);
    }

    #[inline]
    pub fn is_owned_node(&self, v: usize) -> bool {
        self.node_owner[v] == self.rank
    }

    /// True if the vertex participates in any halo list.
    #[inline]
    pub fn is_halo_node(&self, v: usize) -> bool {
        self.send_halo.contains(&v) || self.recv_halo.contains(&v)
    }

    /// Metric length of the edge `(v, w)` from current coordinates and
    /// metrics (closed-form endpoint interpolation).
    pub fn edge_length(&self, v: usize, w: usize) -> f64 {
        let d = crate::geometry::sub(self.coord(w), self.coord(v));
        metric_edge_length(self.dim, self.metric_of(v), self.metric_of(w), d)
    }

    /// The set of vertices adjacent to `v`.
    pub fn node_patch(&self, v: usize) -> HashSet<usize> {
        self.nnlist[v].iter().copied().collect()
    }

    /// Append a vertex received through halo exchange. Returns its local id.
    pub fn append_vertex(&mut self, coords: &[f64], metric: &[f64], owner: usize, gnn: usize) -> usize {
        let v = self.num_nodes();
        self.coords.extend_from_slice(&coords[..self.dim.ndims()]);
        self.metric.extend_from_slice(&metric[..self.dim.msize()]);
        self.nnlist.push(Vec::new());
        self.nelist.push(HashSet::new());
        self.node_owner.push(owner);
        self.lnn2gnn.push(gnn);
        v
    }

    /// Append an element slot. Adjacency is the caller's responsibility
    /// (the halo unpack threads new elements into NNList/NEList/edges).
    pub fn append_element(&mut self, verts: &[usize]) -> usize {
        let e = self.num_elements();
        self.enlist.extend_from_slice(verts);
        e
    }

    /// Mark an element slot deleted.
    #[inline]
    pub fn erase_element(&mut self, e: usize) {
        self.enlist[e * self.dim.nloc()] = INVALID;
    }

    /// Clear a vertex's adjacency, retiring its slot.
    pub fn erase_vertex(&mut self, v: usize) {
        self.nnlist[v].clear();
        self.nelist[v].clear();
    }

    /// Global numbering view: (owned count, lnn→gnn, owner per vertex).
    pub fn create_global_numbering(&self) -> (usize, &[usize], &[usize]) {
        let npnodes = self
            .node_owner
            .iter()
            .filter(|&&o| o == self.rank)
            .count();
        (npnodes, &self.lnn2gnn, &self.node_owner)
    }

    /// Vertices lying on the domain boundary (member of a face that appears
    /// in exactly one live element).
    pub fn boundary_nodes(&self) -> HashSet<usize> {
        let nloc = self.dim.nloc();
        let mut face_count: HashMap<Vec<usize>, usize> = HashMap::new();
        for e in 0..self.num_elements() {
            let verts = match self.element(e) {
                Some(n) => n,
                None => continue,
            };
            for j in 0..nloc {
                let mut face: Vec<usize> = (1..nloc).map(|k| verts[(j + k) % nloc]).collect();
                face.sort_unstable();
                *face_count.entry(face).or_insert(0) += 1;
            }
        }
        let mut out = HashSet::new();
        for (face, count) in face_count {
            if count == 1 {
                out.extend(face);
            }
        }
        out
    }

    /// Validate the quiescent-point adjacency and geometry invariants.
    pub fn validate_invariants(&self) -> Result<(), MeshAdaptError> {
        let property = ElementProperty::new(self.dim);

        // Positive signed measure on every live element.
        for e in 0..self.num_elements() {
            if let Some(verts) = self.element(e) {
                let xs: Vec<[f64; 3]> = verts.iter().map(|&v| self.coord(v)).collect();
                if property.measure(&xs) <= 0.0 {
                    return Err(MeshAdaptError::InvalidGeometry(format!(
                        "element {e} has non-positive signed measure"
                    )));
                }
                for &v in verts {
                    if !self.nelist[v].contains(&e) {
                        return Err(MeshAdaptError::BrokenAdjacency(format!(
                            "element {e} missing from NEList[{v}]"
                        )));
                    }
                }
            }
        }

        // NNList symmetric and duplicate-free; every pair backed by an edge.
        for v in 0..self.num_nodes() {
            let mut seen = HashSet::new();
            for &w in &self.nnlist[v] {
                if !seen.insert(w) {
                    return Err(MeshAdaptError::BrokenAdjacency(format!(
                        "duplicate neighbour {w} in NNList[{v}]"
                    )));
                }
                if !self.nnlist[w].contains(&v) {
                    return Err(MeshAdaptError::BrokenAdjacency(format!(
                        "NNList asymmetry between {v} and {w}"
                    )));
                }
                if !self.edges.contains_key(&edge_key(v, w)) {
                    return Err(MeshAdaptError::BrokenAdjacency(format!(
                        "edge ({v}, {w}) missing from edge table"
                    )));
                }
            }
        }

        // Edge incidence equals the NEList intersection, cardinality >= 1.
        for (&(v, w), edge) in &self.edges {
            let common: HashSet<usize> = self.nelist[v]
                .intersection(&self.nelist[w])
                .copied()
                .collect();
            if edge.elements != common {
                return Err(MeshAdaptError::BrokenAdjacency(format!(
                    "edge ({v}, {w}) incidence does not match NEList intersection"
                )));
            }
            if edge.elements.is_empty() {
                return Err(MeshAdaptError::BrokenAdjacency(format!(
                    "edge ({v}, {w}) has no incident elements"
                )));
            }
        }

        // NEList entries reference live elements containing the vertex.
        for v in 0..self.num_nodes() {
            for &e in &self.nelist[v] {
                match self.element(e) {
                    Some(verts) if verts.contains(&v) => {}
                    _ => {
                        return Err(MeshAdaptError::BrokenAdjacency(format!(
                            "NEList[{v}] references element {e} not containing it"
                        )))
                    }
                }
            }
        }

        // Injective global numbering.
        let mut seen = HashSet::new();
        for &g in &self.lnn2gnn {
            if !seen.insert(g) {
                return Err(MeshAdaptError::DuplicateGlobalNumber(g));
            }
        }

        Ok(())
    }

    /// Count of live elements.
    pub fn live_elements(&self) -> usize {
        (0..self.num_elements()).filter(|&e| self.element(e).is_some()).count()
    }

    /// Count of vertices with non-empty adjacency.
    pub fn live_vertices(&self) -> usize {
        (0..self.num_nodes()).filter(|&v| !self.nnlist[v].is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Unit square split into four triangles around the centroid.
    fn square_four() -> Mesh {
        let coords = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.5, 0.5];
        let tris = [0, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4];
        Mesh::new_2d(&coords, &tris)
    }

    #[test]
    fn adjacency_invariants_hold_after_build() {
        let mesh = square_four();
        mesh.validate_invariants().unwrap();
        assert_eq!(mesh.live_elements(), 4);
        assert_eq!(mesh.nnlist[4].len(), 4);
        assert_eq!(mesh.nelist[4].len(), 4);
    }

    #[test]
    fn edge_lengths_match_euclidean_under_identity_metric() {
        let mesh = square_four();
        assert_relative_eq!(mesh.edge_length(0, 1), 1.0, max_relative = 1e-12);
        assert_relative_eq!(
            mesh.edge_length(0, 4),
            0.5f64.hypot(0.5),
            max_relative = 1e-12
        );
        let diag = mesh.edges.get(&edge_key(0, 4)).unwrap();
        assert_relative_eq!(diag.length, 0.5f64.hypot(0.5), max_relative = 1e-12);
        assert_eq!(diag.elements.len(), 2);
    }

    #[test]
    fn boundary_excludes_interior_centroid() {
        let mesh = square_four();
        let boundary = mesh.boundary_nodes();
        assert_eq!(boundary.len(), 4);
        assert!(!boundary.contains(&4));
    }

    #[test]
    fn erase_element_leaves_sentinel_slot() {
        let mut mesh = square_four();
        mesh.erase_element(2);
        assert!(mesh.element(2).is_none());
        assert_eq!(mesh.num_elements(), 4);
        assert_eq!(mesh.live_elements(), 3);
    }
}
