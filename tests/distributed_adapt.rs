//! Two-rank adaptation over the in-process mailbox communicator: a
//! halo-straddling collapse must leave both ranks with the same mesh, and
//! smoothing must propagate owner moves to mirrors.

use mesh_adapt::prelude::*;
use std::thread;

/// Fully-overlapped two-rank partition of the four-triangle square: every
/// rank stores the whole mesh; rank 0 owns vertices {0, 1, 4}, rank 1 owns
/// {2, 3}. Local indices coincide with global numbers on both ranks.
fn partitioned_square(rank: usize, centroid: (f64, f64)) -> Mesh {
    let coords = [
        0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, centroid.0, centroid.1,
    ];
    let tris = [0, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4];
    let node_owner = vec![0, 0, 1, 1, 0];
    let lnn2gnn = (0..5).collect();
    let mut mesh = Mesh::with_partition(Dim::Two, &coords, &tris, node_owner, lnn2gnn, rank, 2);

    if rank == 0 {
        mesh.send[1] = vec![0, 1, 4];
        mesh.recv[1] = vec![2, 3];
        mesh.send_halo.extend([0, 1, 4]);
        mesh.recv_halo.extend([2, 3]);
    } else {
        mesh.send[0] = vec![2, 3];
        mesh.recv[0] = vec![0, 1, 4];
        mesh.send_halo.extend([2, 3]);
        mesh.recv_halo.extend([0, 1, 4]);
    }
    mesh
}

#[test]
fn halo_straddling_collapse_applies_on_both_ranks() {
    let handles: Vec<_> = MailboxComm::group(2)
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let mut mesh = partitioned_square(comm.rank(), (0.5, 0.5));
                let mut surface = Surface::new(&mesh);

                Coarsen::new(&mut mesh, &mut surface, &comm)
                    .coarsen(0.8, 2.0)
                    .unwrap();
                mesh
            })
        })
        .collect();

    let mut meshes = handles.into_iter().map(|h| h.join().unwrap());
    let m0 = meshes.next().unwrap();
    let m1 = meshes.next().unwrap();

    // The centroid (owned by rank 0, mirrored on rank 1) is gone everywhere.
    for mesh in [&m0, &m1] {
        assert_eq!(mesh.live_elements(), 2);
        assert!(mesh.nnlist[4].is_empty());
        mesh.validate_invariants().unwrap();
    }

    // Identical meshes up to the (shared) numbering.
    assert_eq!(m0.enlist, m1.enlist);
    let sorted = |nn: &Vec<usize>| {
        let mut v = nn.clone();
        v.sort_unstable();
        v
    };
    for v in 0..5 {
        assert_eq!(sorted(&m0.nnlist[v]), sorted(&m1.nnlist[v]), "vertex {v}");
        assert_eq!(m0.nelist[v], m1.nelist[v], "vertex {v}");
    }
}

#[test]
fn smoothing_propagates_owner_moves_to_mirrors() {
    let handles: Vec<_> = MailboxComm::group(2)
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let mut mesh = partitioned_square(comm.rank(), (0.62, 0.57));

                Smooth::new(&mut mesh, &comm)
                    .smooth("Laplacian", 1, None)
                    .unwrap();
                mesh
            })
        })
        .collect();

    let mut meshes = handles.into_iter().map(|h| h.join().unwrap());
    let m0 = meshes.next().unwrap();
    let m1 = meshes.next().unwrap();

    for mesh in [&m0, &m1] {
        let c = mesh.coord(4);
        assert!((c[0] - 0.5).abs() < 1e-9, "centroid x: {}", c[0]);
        assert!((c[1] - 0.5).abs() < 1e-9, "centroid y: {}", c[1]);
        mesh.validate_invariants().unwrap();
    }
    assert_eq!(m0.coords, m1.coords);
    assert_eq!(m0.metric, m1.metric);
}
