//! Edge-collapse mesh coarsening.
//!
//! Removes edges shorter than `l_low` in metric space by collapsing one
//! endpoint onto the other, subject to three guards: surface classification
//! (no corner moves, no patch violations), a hard invertibility bound on the
//! signed-volume ratio of every surviving element, and an upper bound
//! `l_max` on the length of any edge the collapse would create.
//!
//! Scheduling follows Li et al., Comp Methods Appl Mech Engrg 194 (2005):
//! each outer sweep distance-2 colours the mesh graph, picks the colour
//! class with the largest global population as a maximal independent set,
//! ships pending collapses that straddle partition boundaries through the
//! halo, and applies the collapse kernel to every certified vertex of the
//! set. Neighbours of each collapse target are re-examined on the next
//! sweep.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::algs::colour::colour_distance2;
use crate::algs::communicator::{AdaptCommTags, CommTag, Communicator, Wait};
use crate::geometry::ElementProperty;
use crate::mesh::{edge_key, Edge, Mesh};
use crate::mesh_error::MeshAdaptError;
use crate::surface::Surface;

/// Safety cap on outer sweeps.
const MAX_SWEEPS: usize = 100;

/// A collapse is rejected if any surviving element's signed measure would
/// shrink below this fraction of its original.
const MIN_MEASURE_RATIO: f64 = 1.0e-3;

/// Outcome of the identification kernel for one vertex.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CollapseDecision {
    /// Not yet examined.
    Unset,
    /// Collapse onto this neighbour is certified.
    Target(usize),
    /// The vertex is pinned at a geometric corner.
    Corner,
    /// The vertex is owned by another rank.
    Unowned,
    /// No short edge, or every candidate failed a guard.
    Infeasible,
}

impl CollapseDecision {
    #[inline]
    pub fn target(self) -> Option<usize> {
        match self {
            CollapseDecision::Target(w) => Some(w),
            _ => None,
        }
    }
}

/// Edge-collapse coarsening driver over a mesh/surface pair.
pub struct Coarsen<'a, C: Communicator> {
    mesh: &'a mut Mesh,
    surface: &'a mut Surface,
    comm: &'a C,
    property: ElementProperty,
    tags: AdaptCommTags,
}

impl<'a, C: Communicator> Coarsen<'a, C> {
    pub fn new(mesh: &'a mut Mesh, surface: &'a mut Surface, comm: &'a C) -> Self {
        let property = ElementProperty::new(mesh.dim);
        Self {
            mesh,
            surface,
            comm,
            property,
            tags: AdaptCommTags::from_base(CommTag::new(0x0C00)),
        }
    }

    /// Collapse every edge shorter than `l_low` that can be removed without
    /// inverting elements, violating the surface classification, or creating
    /// an edge longer than `l_max`.
    pub fn coarsen(&mut self, l_low: f64, l_max: f64) -> Result<(), MeshAdaptError> {
        let nparts = self.comm.size();
        let mut nnodes = self.mesh.num_nodes();

        let mut decision = self.identify_all(l_low, l_max);
        let mut recalculate = vec![false; nnodes];

        let mut gnn2lnn: HashMap<usize, usize> = self
            .mesh
            .lnn2gnn
            .iter()
            .enumerate()
            .map(|(lnn, &gnn)| (gnn, lnn))
            .collect();

        for sweep in 0..MAX_SWEEPS {
            if sweep == MAX_SWEEPS - 1 {
                warn!("possibly excessive coarsening; please verify results");
            }

            nnodes = self.mesh.num_nodes();
            decision.resize(nnodes, CollapseDecision::Unset);
            recalculate.resize(nnodes, false);

            for v in 0..nnodes {
                if recalculate[v] {
                    recalculate[v] = false;
                    decision[v] = if self.mesh.is_owned_node(v) {
                        self.identify(v, l_low, l_max)
                    } else {
                        CollapseDecision::Unowned
                    };
                }
            }

            let colour = colour_distance2(&self.mesh.nnlist, &self.mesh.lnn2gnn);

            // Per-colour bags of owned vertices with a certified target.
            let mut local_max = -1i32;
            for v in 0..nnodes {
                if self.mesh.is_owned_node(v) && decision[v].target().is_some() {
                    if colour[v] < 0 {
                        return Err(MeshAdaptError::UncolouredVertex(v));
                    }
                    local_max = local_max.max(colour[v]);
                }
            }
            let max_colour = self.comm.allreduce_max_i32(local_max);
            if max_colour < 0 {
                debug!(sweeps = sweep, "coarsening converged");
                break;
            }

            let mut colour_sets: Vec<Vec<usize>> = vec![Vec::new(); max_colour as usize];
            let mut set_sizes = vec![0u64; max_colour as usize];
            for v in 0..nnodes {
                if self.mesh.is_owned_node(v) && decision[v].target().is_some() {
                    let c = (colour[v] - 1) as usize;
                    colour_sets[c].push(v);
                    set_sizes[c] += 1;
                }
            }
            self.comm.allreduce_sum_u64(&mut set_sizes);

            // Largest global class wins; ties break by lowest colour id.
            let (best, best_size) = set_sizes
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
                .expect("max_colour >= 1 implies a non-empty size table");
            if best_size == 0 {
                break;
            }
            let mut independent_set = std::mem::take(&mut colour_sets[best]);

            if nparts > 1 {
                self.exchange_pending_collapses(
                    &mut independent_set,
                    &mut decision,
                    &mut recalculate,
                    &mut gnn2lnn,
                )?;
            }

            debug!(
                sweep,
                colour = best + 1,
                set = independent_set.len(),
                "applying independent set"
            );

            for i in 0..independent_set.len() {
                let rm = independent_set[i];
                let target = decision[rm]
                    .target()
                    .ok_or(MeshAdaptError::UncertifiedCollapse(rm))?;

                self.coarsen_kernel(rm, target)?;

                if self.mesh.is_owned_node(target) {
                    decision[target] = self.identify(target, l_low, l_max);
                }
                for &x in &self.mesh.nnlist[target] {
                    recalculate[x] = true;
                }
                decision[rm] = CollapseDecision::Unset;
            }
        }

        Ok(())
    }

    /// Run the identification kernel over every vertex; non-owned vertices
    /// are marked without inspection.
    fn identify_all(&self, l_low: f64, l_max: f64) -> Vec<CollapseDecision> {
        let nnodes = self.mesh.num_nodes();
        let kernel = |v: usize| {
            if self.mesh.is_owned_node(v) {
                self.identify(v, l_low, l_max)
            } else {
                CollapseDecision::Unowned
            }
        };
        #[cfg(feature = "rayon")]
        return (0..nnodes).into_par_iter().map(kernel).collect();
        #[cfg(not(feature = "rayon"))]
        return (0..nnodes).map(kernel).collect();
    }

    /// Decide what, if anything, `rm` should collapse onto. Candidate edges
    /// shorter than `l_low` are tried shortest-first; the first one that
    /// keeps every surviving element valid and every new edge within
    /// `l_max` wins.
    pub fn identify(&self, rm: usize, l_low: f64, l_max: f64) -> CollapseDecision {
        if self.surface.is_corner_vertex(rm) {
            return CollapseDecision::Corner;
        }
        if !self.mesh.is_owned_node(rm) {
            return CollapseDecision::Unowned;
        }

        let mut short_edges: Vec<(f64, usize)> = Vec::new();
        for &w in &self.mesh.nnlist[rm] {
            // No collapsing across a halo receive boundary.
            if self.mesh.recv_halo.contains(&w) {
                continue;
            }
            if !self.surface.is_collapsible(rm, w) {
                continue;
            }
            if let Some(edge) = self.mesh.edges.get(&edge_key(rm, w)) {
                if edge.length < l_low {
                    short_edges.push((edge.length, w));
                }
            }
        }
        short_edges.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        'candidates: for &(_, target) in &short_edges {
            let target_elements = &self.mesh.edges[&edge_key(rm, target)].elements;

            // Every element that survives the collapse must keep a signed
            // measure close to its original: a hard invertibility guard.
            for &e in &self.mesh.nelist[rm] {
                if target_elements.contains(&e) {
                    continue;
                }
                let verts = match self.mesh.element(e) {
                    Some(n) => n,
                    None => continue,
                };
                let orig: Vec<[f64; 3]> = verts.iter().map(|&v| self.mesh.coord(v)).collect();
                let moved: Vec<[f64; 3]> = verts
                    .iter()
                    .map(|&v| self.mesh.coord(if v == rm { target } else { v }))
                    .collect();
                let orig_measure = self.property.measure(&orig);
                let new_measure = self.property.measure(&moved);
                if new_measure / orig_measure <= MIN_MEASURE_RATIO {
                    continue 'candidates;
                }
            }

            // No created edge may exceed l_max.
            for &x in &self.mesh.nnlist[rm] {
                if x == target {
                    continue;
                }
                if self.mesh.edge_length(target, x) > l_max {
                    continue 'candidates;
                }
            }

            return CollapseDecision::Target(target);
        }

        CollapseDecision::Infeasible
    }

    /// Collapse `rm` onto `target`. Both endpoints and all adjacency must be
    /// consistent and the pair certified by [`Coarsen::identify`].
    pub fn coarsen_kernel(&mut self, rm: usize, target: usize) -> Result<(), MeshAdaptError> {
        let nloc = self.mesh.dim.nloc();
        let key_rt = edge_key(rm, target);

        let deleted: Vec<usize> = self
            .mesh
            .edges
            .get(&key_rt)
            .ok_or_else(|| {
                MeshAdaptError::BrokenAdjacency(format!("collapse edge ({rm}, {target}) missing"))
            })?
            .elements
            .iter()
            .copied()
            .collect();

        if self.surface.contains_node(rm) && self.surface.contains_node(target) {
            self.surface.collapse(rm, target);
        }

        // Drop the deleted element ids from every other bounding edge.
        for &de in &deleted {
            let verts: Vec<usize> = self
                .mesh
                .element(de)
                .ok_or_else(|| {
                    MeshAdaptError::BrokenAdjacency(format!("deleted element {de} already gone"))
                })?
                .to_vec();
            for i in 0..nloc {
                for j in (i + 1)..nloc {
                    let k = edge_key(verts[i], verts[j]);
                    if k == key_rt {
                        continue;
                    }
                    if let Some(edge) = self.mesh.edges.get_mut(&k) {
                        edge.elements.remove(&de);
                    }
                }
            }
        }

        // Substitute target for rm in surviving elements; retire the rest.
        let rm_elements: Vec<usize> = self.mesh.nelist[rm].iter().copied().collect();
        for &e in &rm_elements {
            if deleted.contains(&e) {
                self.mesh.erase_element(e);
            } else {
                let base = e * nloc;
                for i in 0..nloc {
                    if self.mesh.enlist[base + i] == rm {
                        self.mesh.enlist[base + i] = target;
                        break;
                    }
                }
                self.mesh.nelist[target].insert(e);
            }
        }
        for &de in &deleted {
            self.mesh.nelist[target].remove(&de);
        }

        let adj_target: HashSet<usize> = self.mesh.node_patch(target);
        let rm_neighbours: Vec<usize> = self.mesh.nnlist[rm].clone();

        // Re-key the edges of rm. An edge collapsing onto an existing edge
        // of the target merges incidence and keeps the cached length; a
        // renamed edge gets its metric length recomputed.
        for &x in &rm_neighbours {
            let old = self.mesh.edges.remove(&edge_key(rm, x)).ok_or_else(|| {
                MeshAdaptError::BrokenAdjacency(format!("edge ({rm}, {x}) missing during collapse"))
            })?;
            if x == target {
                continue;
            }
            if adj_target.contains(&x) {
                let merged = self.mesh.edges.get_mut(&edge_key(target, x)).ok_or_else(|| {
                    MeshAdaptError::BrokenAdjacency(format!(
                        "edge ({target}, {x}) missing during merge"
                    ))
                })?;
                merged.elements.extend(old.elements.iter().copied());
            } else {
                let length = self.mesh.edge_length(target, x);
                self.mesh.edges.insert(
                    edge_key(target, x),
                    Edge {
                        length,
                        elements: old.elements,
                    },
                );
            }
        }

        // NNList fixups around the cavity.
        for &x in &rm_neighbours {
            if x == target {
                let mut patch = adj_target.clone();
                patch.extend(rm_neighbours.iter().copied());
                patch.remove(&rm);
                patch.remove(&target);
                let mut rebuilt: Vec<usize> = patch.into_iter().collect();
                rebuilt.sort_unstable();
                self.mesh.nnlist[target] = rebuilt;
            } else if adj_target.contains(&x) {
                for &de in &deleted {
                    self.mesh.nelist[x].remove(&de);
                }
                self.mesh.nnlist[x].retain(|&y| y != rm);
            } else {
                for y in self.mesh.nnlist[x].iter_mut() {
                    if *y == rm {
                        *y = target;
                        break;
                    }
                }
            }
        }

        self.mesh.erase_vertex(rm);
        Ok(())
    }

    /// Ship pending collapses that straddle partition boundaries. Every
    /// chosen halo vertex is announced to each peer that mirrors it,
    /// together with its incident elements, the facets on those elements,
    /// and any vertices the peer has never seen, all encoded under the
    /// global numbering. A second all-to-all round distributes the newly
    /// learnt vertices to their owners so both sides extend their halo
    /// lists symmetrically.
    fn exchange_pending_collapses(
        &mut self,
        independent_set: &mut Vec<usize>,
        decision: &mut Vec<CollapseDecision>,
        recalculate: &mut Vec<bool>,
        gnn2lnn: &mut HashMap<usize, usize>,
    ) -> Result<(), MeshAdaptError> {
        let nparts = self.comm.size();
        let rank = self.comm.rank();
        let nloc = self.mesh.dim.nloc();
        let snloc = self.mesh.dim.snloc();
        let ndims = self.mesh.dim.ndims();
        let msize = self.mesh.dim.msize();

        // Cache who knows what.
        let mut known: Vec<HashSet<usize>> = vec![HashSet::new(); nparts];
        for p in 0..nparts {
            if p == rank {
                continue;
            }
            known[p].extend(self.mesh.send[p].iter().copied());
            known[p].extend(self.mesh.recv[p].iter().copied());
        }

        let mut send_edges: Vec<Vec<(usize, usize)>> = vec![Vec::new(); nparts];
        let mut send_elements: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nparts];
        for &rm in independent_set.iter() {
            if !self.mesh.is_halo_node(rm) {
                continue;
            }
            let target = decision[rm]
                .target()
                .ok_or(MeshAdaptError::UncertifiedCollapse(rm))?;
            for p in 0..nparts {
                if p != rank && known[p].contains(&rm) {
                    send_edges[p].push((self.mesh.lnn2gnn[rm], self.mesh.lnn2gnn[target]));
                    send_elements[p].extend(self.mesh.nelist[rm].iter().copied());
                }
            }
        }

        // A peer already holds any element with one of its own vertices;
        // everything else it needs in full, plus any unknown vertices.
        let mut send_nodes: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nparts];
        let mut send_facets: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nparts];
        for p in 0..nparts {
            if p == rank {
                continue;
            }
            let keep: Vec<usize> = send_elements[p]
                .iter()
                .copied()
                .filter(|&e| match self.mesh.element(e) {
                    Some(verts) => verts.iter().all(|&v| self.mesh.node_owner[v] != p),
                    None => false,
                })
                .collect();
            send_elements[p] = keep.iter().copied().collect();
            for &e in &keep {
                let verts = self.mesh.element(e).expect("kept element is live");
                for &v in verts {
                    if !known[p].contains(&v) {
                        send_nodes[p].insert(v);
                    }
                }
                send_facets[p].extend(self.surface.find_facets(verts));
            }
        }

        // Pack. All words are u64; floats travel as bit patterns.
        let mut send_buffers: Vec<Vec<u64>> = vec![Vec::new(); nparts];
        for p in 0..nparts {
            if p == rank || send_edges[p].is_empty() {
                continue;
            }
            let buf = &mut send_buffers[p];

            buf.push(send_nodes[p].len() as u64);
            for &v in &send_nodes[p] {
                buf.push(self.mesh.lnn2gnn[v] as u64);
                buf.push(self.mesh.node_owner[v] as u64);
                let x = self.mesh.coord(v);
                for item in x.iter().take(ndims) {
                    buf.push(item.to_bits());
                }
                for m in self.mesh.metric_of(v) {
                    buf.push(m.to_bits());
                }
            }

            buf.push(send_edges[p].len() as u64);
            for &(g_rm, g_target) in &send_edges[p] {
                buf.push(g_rm as u64);
                buf.push(g_target as u64);
            }

            buf.push(send_elements[p].len() as u64);
            for &e in &send_elements[p] {
                let verts = self.mesh.element(e).expect("kept element is live");
                for &v in verts {
                    buf.push(self.mesh.lnn2gnn[v] as u64);
                }
            }

            buf.push(send_facets[p].len() as u64);
            for &f in &send_facets[p] {
                let verts = self.surface.facet(f).expect("packed facet is live");
                for &v in verts {
                    buf.push(self.mesh.lnn2gnn[v] as u64);
                }
                buf.push(self.surface.coplanar_id(f) as u64);
            }
        }

        let recv_words = self.exchange_buffers(&send_buffers, self.tags.collapses)?;

        // Unpack, registering incoming collapses into the independent set.
        let mut extra_halo: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nparts];
        for (p, words) in recv_words.iter().enumerate() {
            if words.is_empty() {
                continue;
            }
            let mut cursor = WordCursor::new(words, p);

            let num_nodes = cursor.next()? as usize;
            for _ in 0..num_nodes {
                let gnn = cursor.next()? as usize;
                let owner = cursor.next()? as usize;
                let mut coords = [0.0f64; 3];
                for item in coords.iter_mut().take(ndims) {
                    *item = f64::from_bits(cursor.next()?);
                }
                let mut metric = [0.0f64; 6];
                for item in metric.iter_mut().take(msize) {
                    *item = f64::from_bits(cursor.next()?);
                }

                if !gnn2lnn.contains_key(&gnn) {
                    let lnn = self
                        .mesh
                        .append_vertex(&coords[..ndims], &metric[..msize], owner, gnn);
                    gnn2lnn.insert(gnn, lnn);
                    decision.push(CollapseDecision::Unowned);
                    recalculate.push(false);
                    extra_halo[owner].insert(gnn);
                }
            }

            let num_edges = cursor.next()? as usize;
            for _ in 0..num_edges {
                let g_rm = cursor.next()? as usize;
                let g_target = cursor.next()? as usize;
                let rm = *gnn2lnn
                    .get(&g_rm)
                    .ok_or(MeshAdaptError::UnknownGlobalVertex(g_rm))?;
                let target = *gnn2lnn
                    .get(&g_target)
                    .ok_or(MeshAdaptError::UnknownGlobalVertex(g_target))?;
                decision[rm] = CollapseDecision::Target(target);
                independent_set.push(rm);
            }

            let num_elements = cursor.next()? as usize;
            for _ in 0..num_elements {
                let mut verts = [0usize; 4];
                for item in verts.iter_mut().take(nloc) {
                    let g = cursor.next()? as usize;
                    *item = *gnn2lnn
                        .get(&g)
                        .ok_or(MeshAdaptError::UnknownGlobalVertex(g))?;
                }
                let verts = &verts[..nloc];

                // Known in full iff every bounding edge is already present.
                let is_new = (0..nloc).any(|i| {
                    ((i + 1)..nloc)
                        .any(|j| !self.mesh.edges.contains_key(&edge_key(verts[i], verts[j])))
                });
                if !is_new {
                    continue;
                }

                let eid = self.mesh.append_element(verts);
                for i in 0..nloc {
                    self.mesh.nelist[verts[i]].insert(eid);
                    for j in (i + 1)..nloc {
                        let (a, b) = (verts[i], verts[j]);
                        if !self.mesh.nnlist[a].contains(&b) {
                            self.mesh.nnlist[a].push(b);
                            self.mesh.nnlist[b].push(a);
                        }
                        let length = self.mesh.edge_length(a, b);
                        let edge = self
                            .mesh
                            .edges
                            .entry(edge_key(a, b))
                            .or_insert_with(|| Edge {
                                length,
                                elements: HashSet::new(),
                            });
                        edge.elements.insert(eid);
                    }
                }
            }

            let num_facets = cursor.next()? as usize;
            for _ in 0..num_facets {
                let mut verts = [0usize; 3];
                for item in verts.iter_mut().take(snloc) {
                    let g = cursor.next()? as usize;
                    *item = *gnn2lnn
                        .get(&g)
                        .ok_or(MeshAdaptError::UnknownGlobalVertex(g))?;
                }
                let coplanar_id = cursor.next()? as i32;
                self.surface
                    .append_facet(&verts[..snloc], coplanar_id, self.mesh);
            }
        }

        // Second round: tell each owner which of its vertices we have just
        // learnt about, so the send/recv halo lists grow symmetrically.
        let mut ext_buffers: Vec<Vec<u64>> = vec![Vec::new(); nparts];
        for p in 0..nparts {
            ext_buffers[p] = extra_halo[p].iter().map(|&g| g as u64).collect();
        }
        let ext_recv = self.exchange_buffers(&ext_buffers, self.tags.halo_extension)?;

        for p in 0..nparts {
            if p == rank {
                continue;
            }
            for &g in &ext_recv[p] {
                let lnn = *gnn2lnn
                    .get(&(g as usize))
                    .ok_or(MeshAdaptError::UnknownGlobalVertex(g as usize))?;
                self.mesh.send[p].push(lnn);
                self.mesh.send_halo.insert(lnn);
            }
            for &g in &extra_halo[p] {
                let lnn = *gnn2lnn
                    .get(&g)
                    .ok_or(MeshAdaptError::UnknownGlobalVertex(g))?;
                self.mesh.recv[p].push(lnn);
                self.mesh.recv_halo.insert(lnn);
            }
        }

        Ok(())
    }

    /// Size-exchange then non-blocking transfer of per-peer u64 buffers.
    fn exchange_buffers(
        &self,
        send: &[Vec<u64>],
        tag: CommTag,
    ) -> Result<Vec<Vec<u64>>, MeshAdaptError> {
        let nparts = self.comm.size();
        let rank = self.comm.rank();

        let counts: Vec<u32> = send.iter().map(|b| b.len() as u32).collect();
        let recv_counts = self.comm.alltoall_counts(&counts);

        let mut recv_handles = Vec::new();
        for p in 0..nparts {
            if p == rank || recv_counts[p] == 0 {
                continue;
            }
            let mut template = vec![0u8; recv_counts[p] as usize * 8];
            recv_handles.push((p, self.comm.irecv(p, tag.as_u16(), &mut template)));
        }

        let mut send_handles = Vec::new();
        for p in 0..nparts {
            if p == rank || send[p].is_empty() {
                continue;
            }
            send_handles.push(self.comm.isend(p, tag.as_u16(), bytemuck::cast_slice(&send[p])));
        }

        let mut out: Vec<Vec<u64>> = vec![Vec::new(); nparts];
        for (p, handle) in recv_handles {
            let bytes = handle
                .wait()
                .ok_or(MeshAdaptError::TruncatedHaloMessage(p))?;
            if bytes.len() < recv_counts[p] as usize * 8 {
                return Err(MeshAdaptError::TruncatedHaloMessage(p));
            }
            out[p] = bytes
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect();
        }
        for handle in send_handles {
            handle.wait();
        }
        Ok(out)
    }
}

/// Bounds-checked reader over a received word stream.
struct WordCursor<'b> {
    words: &'b [u64],
    pos: usize,
    from: usize,
}

impl<'b> WordCursor<'b> {
    fn new(words: &'b [u64], from: usize) -> Self {
        Self {
            words,
            pos: 0,
            from,
        }
    }

    fn next(&mut self) -> Result<u64, MeshAdaptError> {
        let w = self
            .words
            .get(self.pos)
            .copied()
            .ok_or(MeshAdaptError::TruncatedHaloMessage(self.from))?;
        self.pos += 1;
        Ok(w)
    }
}
